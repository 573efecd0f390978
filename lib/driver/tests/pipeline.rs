//! Pipeline tests over a stubbed toolchain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use goscript_driver::{
    ArtifactMetadata, CancelHandle, Driver, DriverConfig, DriverState, EventHandler,
    MemoryArtifactCache, Stage, StageStatus, Tool, ToolInvocation, Toolchain, ToolchainError,
    WASM_MAGIC,
};
use goscript_pack::{MemoryStore, PackBuilder, PackStore};

const PACK_URL: &str = "https://packs.test/toolchain.pack";

/// What the stub linker leaves behind.
#[derive(Clone, Copy)]
enum LinkerOutput {
    Wasm,
    Nothing,
    Garbage,
}

struct FakeToolchain {
    compiles: Arc<AtomicUsize>,
    links: Arc<AtomicUsize>,
    emit_object: Arc<AtomicBool>,
    linker_output: LinkerOutput,
    diagnostics: Option<&'static str>,
    exit_code: i32,
}

impl FakeToolchain {
    fn well_behaved(compiles: &Arc<AtomicUsize>, links: &Arc<AtomicUsize>) -> Self {
        Self {
            compiles: Arc::clone(compiles),
            links: Arc::clone(links),
            emit_object: Arc::new(AtomicBool::new(true)),
            linker_output: LinkerOutput::Wasm,
            diagnostics: None,
            exit_code: 0,
        }
    }

    fn output_path(argv: &[String]) -> String {
        argv.iter()
            .position(|a| a == "-o")
            .and_then(|i| argv.get(i + 1))
            .expect("tool invocations carry -o")
            .clone()
    }
}

impl Toolchain for FakeToolchain {
    fn run_tool(&mut self, invocation: ToolInvocation) -> Result<i32, ToolchainError> {
        if let Some(text) = self.diagnostics {
            invocation.stderr.write_text(text);
        }
        let out = Self::output_path(&invocation.argv);
        match invocation.tool {
            Tool::Compiler => {
                self.compiles.fetch_add(1, Ordering::SeqCst);
                if self.emit_object.load(Ordering::SeqCst) && self.exit_code == 0 {
                    invocation.vfs.write_file(&out, b"OBJECT".to_vec());
                }
            }
            Tool::Linker => {
                self.links.fetch_add(1, Ordering::SeqCst);
                match self.linker_output {
                    LinkerOutput::Wasm => {
                        let mut wasm = WASM_MAGIC.to_vec();
                        wasm.extend_from_slice(b"linked-program");
                        invocation.vfs.write_file(&out, wasm);
                    }
                    LinkerOutput::Garbage => {
                        invocation.vfs.write_file(&out, b"ELF not wasm".to_vec());
                    }
                    LinkerOutput::Nothing => {}
                }
            }
        }
        Ok(self.exit_code)
    }
}

fn pack_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let pack = PackBuilder::new()
        .compiler(Vec::new())
        .linker(Vec::new())
        .package("fmt", b"fmt-archive".to_vec())
        .build();
    store.put(PACK_URL, &pack);
    store
}

fn driver_with(toolchain: FakeToolchain) -> Driver {
    let config = DriverConfig::new(PACK_URL)
        .pack_store(pack_store())
        .artifact_cache(Arc::new(MemoryArtifactCache::new()));
    Driver::with_toolchain(config, Box::new(toolchain))
}

#[test]
fn first_compile_runs_the_toolchain_and_produces_wasm() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    let outcome = driver.compile("package main");
    assert!(outcome.success, "error: {:?}", outcome.error);
    let wasm = outcome.wasm.unwrap();
    assert_eq!(&wasm[..8], &WASM_MAGIC);
    assert_eq!(compiles.load(Ordering::SeqCst), 1);
    assert_eq!(links.load(Ordering::SeqCst), 1);
    assert_eq!(driver.state(), DriverState::Complete);
    assert!(!outcome.metadata.cache_hit);
    assert_eq!(outcome.metadata.source_files, 1);
    assert_eq!(outcome.metadata.wasm_size, wasm.len() as u64);

    // published into the staging filesystem too
    assert!(driver.vfs().is_file("/output/main.wasm"));
}

#[test]
fn second_compile_short_circuits_through_the_cache() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    let first = driver.compile("package main");
    let second = driver.compile("package main");

    assert!(second.success);
    assert!(second.metadata.cache_hit);
    assert_eq!(first.wasm, second.wasm);
    // the foreign compiler ran exactly once across both calls
    assert_eq!(compiles.load(Ordering::SeqCst), 1);
    assert_eq!(links.load(Ordering::SeqCst), 1);

    let stats = driver.stats();
    assert_eq!(stats.compiles, 2);
    assert_eq!(stats.cache_hits, 1);
}

#[test]
fn different_sources_miss_the_cache() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    assert!(driver.compile("package main // a").success);
    assert!(driver.compile("package main // b").success);
    assert_eq!(compiles.load(Ordering::SeqCst), 2);
}

#[test]
fn compiler_without_object_fails_the_compile_stage() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut toolchain = FakeToolchain::well_behaved(&compiles, &links);
    toolchain.emit_object = Arc::new(AtomicBool::new(false));
    let mut driver = driver_with(toolchain);

    let outcome = driver.compile("package main");
    assert!(!outcome.success);
    assert!(outcome.error.as_ref().unwrap().contains("Compile"));
    assert_eq!(driver.state(), DriverState::Error);
    // the pipeline stopped before the linker
    assert_eq!(links.load(Ordering::SeqCst), 0);
}

#[test]
fn compiler_diagnostics_surface_in_the_error() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut toolchain = FakeToolchain::well_behaved(&compiles, &links);
    toolchain.diagnostics = Some("main.go:3:1: syntax error");
    toolchain.exit_code = 1;
    let mut driver = driver_with(toolchain);

    let outcome = driver.compile("package main");
    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert!(error.contains("syntax error"), "got: {error}");
    assert!(error.contains("exit code 1"), "got: {error}");
}

#[test]
fn linker_garbage_fails_validation() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut toolchain = FakeToolchain::well_behaved(&compiles, &links);
    toolchain.linker_output = LinkerOutput::Garbage;
    let mut driver = driver_with(toolchain);

    let outcome = driver.compile("package main");
    assert!(!outcome.success);
    assert!(outcome
        .error
        .unwrap()
        .contains("not WebAssembly"));
}

#[test]
fn linker_without_output_fails_the_link_stage() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut toolchain = FakeToolchain::well_behaved(&compiles, &links);
    toolchain.linker_output = LinkerOutput::Nothing;
    let mut driver = driver_with(toolchain);

    let outcome = driver.compile("package main");
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("Link"));
}

#[test]
fn errors_do_not_latch_the_driver() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut toolchain = FakeToolchain::well_behaved(&compiles, &links);
    let emit_object = Arc::new(AtomicBool::new(false));
    toolchain.emit_object = Arc::clone(&emit_object);
    let mut driver = driver_with(toolchain);

    assert!(!driver.compile("package main").success);
    assert_eq!(driver.state(), DriverState::Error);

    emit_object.store(true, Ordering::SeqCst);
    let outcome = driver.compile("package main");
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert_eq!(driver.state(), DriverState::Complete);
}

#[test]
fn corrupted_pack_fails_compilation() {
    let store = Arc::new(MemoryStore::new());
    let mut raw = PackBuilder::new().build().to_vec();
    raw[7] ^= 0x01; // GOSCRIPT -> GOSCRIPU
    store.put(PACK_URL, &Bytes::from(raw));

    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let config = DriverConfig::new(PACK_URL).pack_store(store);
    let mut driver = Driver::with_toolchain(
        config,
        Box::new(FakeToolchain::well_behaved(&compiles, &links)),
    );

    assert!(driver.init().is_err());
    let outcome = driver.compile("package main");
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("malformed pack"));
    assert_eq!(driver.state(), DriverState::Error);
}

#[test]
fn empty_pack_loads_with_no_packages() {
    let store = Arc::new(MemoryStore::new());
    store.put(PACK_URL, &PackBuilder::new().build());

    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let config = DriverConfig::new(PACK_URL).pack_store(store);
    let mut driver = Driver::with_toolchain(
        config,
        Box::new(FakeToolchain::well_behaved(&compiles, &links)),
    );

    driver.init().unwrap();
    assert!(driver.packages().is_empty());
    assert!(!driver.has_package("fmt"));
}

#[test]
fn packages_are_visible_after_init() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    driver.init().unwrap();
    assert!(driver.has_package("fmt"));
    assert_eq!(driver.packages(), vec!["fmt".to_string()]);
    assert!(driver.vfs().is_file("/pkg/js_wasm/fmt.a"));
    assert_eq!(driver.stats().packages, 1);
}

#[derive(Default)]
struct RecordingHandler {
    events: Arc<Mutex<Vec<String>>>,
    completions: Arc<Mutex<Vec<(usize, ArtifactMetadata)>>>,
}

impl EventHandler for RecordingHandler {
    fn progress(&mut self, pct: u8, message: &str) {
        self.events.lock().unwrap().push(format!("progress {pct} {message}"));
    }

    fn stage(&mut self, stage: Stage, status: StageStatus) {
        self.events
            .lock()
            .unwrap()
            .push(format!("stage {stage} {status:?}"));
    }

    fn complete(&mut self, wasm: &Bytes, metadata: &ArtifactMetadata) {
        self.completions
            .lock()
            .unwrap()
            .push((wasm.len(), metadata.clone()));
    }
}

#[test]
fn stages_are_announced_in_order() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    let handler = RecordingHandler::default();
    let events = Arc::clone(&handler.events);
    let completions = Arc::clone(&handler.completions);
    driver.set_event_handler(handler);

    assert!(driver.compile("package main").success);

    let events = events.lock().unwrap();
    let stage_starts: Vec<&str> = events
        .iter()
        .filter(|e| e.starts_with("stage") && e.ends_with("Started"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        stage_starts,
        [
            "stage load-toolchain Started",
            "stage cache-check Started",
            "stage stage-sources Started",
            "stage prepare-build Started",
            "stage compile Started",
            "stage link Started",
            "stage publish Started",
        ]
    );
    assert!(events.iter().any(|e| e.starts_with("progress 100")));

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1.target, "js_wasm");
}

struct CancellingHandler {
    handle: CancelHandle,
    at: Stage,
}

impl EventHandler for CancellingHandler {
    fn stage(&mut self, stage: Stage, status: StageStatus) {
        if stage == self.at && status == StageStatus::Started {
            self.handle.cancel();
        }
    }
}

#[test]
fn cancellation_stops_at_the_next_stage_boundary() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    let handler = CancellingHandler {
        handle: driver.cancel_handle(),
        at: Stage::StageSources,
    };
    driver.set_event_handler(handler);

    let outcome = driver.compile("package main");
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("cancelled"));
    assert_eq!(driver.state(), DriverState::Cancelled);
    // the foreign compiler never ran
    assert_eq!(compiles.load(Ordering::SeqCst), 0);

    // a later compile is accepted
    driver.set_event_handler(goscript_driver::NullEventHandler);
    assert!(driver.compile("package main").success);
}

#[test]
fn reset_clears_staging_and_recovers() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    assert!(driver.compile("package main").success);
    driver.reset();
    assert_eq!(driver.state(), DriverState::Idle);
    assert!(!driver.vfs().is_file("/output/main.wasm"));

    // archives re-stage and compilation still works
    let outcome = driver.compile("package main // changed");
    assert!(outcome.success, "error: {:?}", outcome.error);
    assert!(driver.vfs().is_file("/pkg/js_wasm/fmt.a"));
}

#[test]
fn invalid_run_bytes_fail_gracefully() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let links = Arc::new(AtomicUsize::new(0));
    let mut driver = driver_with(FakeToolchain::well_behaved(&compiles, &links));

    let outcome = driver.run(&Bytes::from_static(b"not wasm"), Default::default());
    assert!(!outcome.success);
    assert_eq!(outcome.exit_code, -1);
    assert!(outcome.error.is_some());
}
