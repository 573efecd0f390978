//! The build driver.
//!
//! Orchestrates the pipeline `load-toolchain → cache-check →
//! stage-sources → prepare-build → compile → link → publish` over a
//! shared in-memory filesystem, emitting stage and progress events along
//! the way. One compilation runs at a time; identical inputs
//! short-circuit through the artifact cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use wasmer::{Module, Store};

use goscript_gojs::GoRunner;
use goscript_pack::{archive_dir, load_pack, MemoryStore, Pack, PackError, PackStore};
use goscript_vfs::{CaptureSink, SharedSink, Vfs, VfsStats};

pub mod artifact;
pub mod events;
pub mod toolchain;

pub use artifact::{
    source_hash, ArtifactCache, ArtifactMetadata, ArtifactRecord, FileSystemArtifactCache,
    MemoryArtifactCache,
};
pub use events::{EventHandler, NullEventHandler, Stage, StageStatus};
pub use toolchain::{Tool, ToolInvocation, Toolchain, ToolchainError, WasmToolchain};

use artifact::source_hash as hash_sources;

/// `\0asm` followed by version 1.
pub const WASM_MAGIC: [u8; 8] = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

pub fn is_wasm(bytes: &[u8]) -> bool {
    bytes.len() >= WASM_MAGIC.len() && bytes[..WASM_MAGIC.len()] == WASM_MAGIC
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error("Compile stage failed: {0}")]
    Compile(String),
    #[error("Link stage failed: {0}")]
    Link(String),
    #[error("produced binary is not WebAssembly")]
    Format,
    #[error("a compilation is already in progress")]
    Busy,
    #[error("compilation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Compiling,
    Complete,
    Error,
    Cancelled,
}

/// The input files of one compilation, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSet(BTreeMap<String, String>);

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.0.insert(path.into(), content.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.0.values().map(|c| c.len() as u64).sum()
    }
}

impl From<&str> for SourceSet {
    /// A bare string compiles as `main.go`.
    fn from(source: &str) -> Self {
        let mut set = Self::new();
        set.insert("main.go", source);
        set
    }
}

impl From<String> for SourceSet {
    fn from(source: String) -> Self {
        let mut set = Self::new();
        set.insert("main.go", source);
        set
    }
}

impl From<BTreeMap<String, String>> for SourceSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for SourceSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileMetadata {
    pub compile_time: Duration,
    pub wasm_size: u64,
    pub source_files: usize,
    pub cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub success: bool,
    pub wasm: Option<Bytes>,
    pub error: Option<String>,
    pub metadata: CompileMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct DriverStats {
    pub state: DriverState,
    pub vfs: VfsStats,
    pub packages: usize,
    pub compiles: u64,
    pub cache_hits: u64,
}

/// Requests cancellation of the compilation in progress. The pipeline
/// observes the request at the next stage boundary.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

pub struct DriverConfig {
    pack_url: String,
    pack_store: Arc<dyn PackStore>,
    artifact_cache: Arc<dyn ArtifactCache>,
    handler: Box<dyn EventHandler>,
    tool_timeout: Option<Duration>,
}

impl DriverConfig {
    pub fn new(pack_url: impl Into<String>) -> Self {
        Self {
            pack_url: pack_url.into(),
            pack_store: Arc::new(MemoryStore::new()),
            artifact_cache: Arc::new(MemoryArtifactCache::new()),
            handler: Box::new(NullEventHandler),
            tool_timeout: None,
        }
    }

    pub fn pack_store(mut self, store: Arc<dyn PackStore>) -> Self {
        self.pack_store = store;
        self
    }

    pub fn artifact_cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.artifact_cache = cache;
        self
    }

    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Bound each foreign-module invocation; expiry fails the stage.
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }
}

pub struct Driver {
    pack_url: String,
    pack_store: Arc<dyn PackStore>,
    artifact_cache: Arc<dyn ArtifactCache>,
    handler: Box<dyn EventHandler>,
    tool_timeout: Option<Duration>,
    vfs: Vfs,
    pack: Option<Pack>,
    toolchain: Option<Box<dyn Toolchain>>,
    state: DriverState,
    cancel: Arc<AtomicBool>,
    compiles: u64,
    cache_hits: u64,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            pack_url: config.pack_url,
            pack_store: config.pack_store,
            artifact_cache: config.artifact_cache,
            handler: config.handler,
            tool_timeout: config.tool_timeout,
            vfs: Vfs::new(),
            pack: None,
            toolchain: None,
            state: DriverState::Idle,
            cancel: Arc::new(AtomicBool::new(false)),
            compiles: 0,
            cache_hits: 0,
        }
    }

    /// Construct with an injected tool execution engine instead of the
    /// pack's wasm modules.
    pub fn with_toolchain(config: DriverConfig, toolchain: Box<dyn Toolchain>) -> Self {
        let mut driver = Self::new(config);
        driver.toolchain = Some(toolchain);
        driver
    }

    pub fn set_event_handler(&mut self, handler: impl EventHandler + 'static) {
        self.handler = Box::new(handler);
    }

    /// Load and parse the pack and stage the stdlib archives. Idempotent;
    /// the first `compile` calls it implicitly.
    pub fn init(&mut self) -> DriverResult<()> {
        self.run_stage(Stage::LoadToolchain, |d| d.ensure_toolchain())
    }

    fn ensure_toolchain(&mut self) -> DriverResult<()> {
        if self.pack.is_none() {
            let pack = load_pack(&self.pack_url, self.pack_store.as_ref())?;
            if self.toolchain.is_none() {
                let mut toolchain = WasmToolchain::new(pack.compiler(), pack.linker());
                if let Some(timeout) = self.tool_timeout {
                    toolchain = toolchain.with_timeout(timeout);
                }
                self.toolchain = Some(Box::new(toolchain));
            }
            self.pack = Some(pack);
        }
        // archives vanish on reset(); re-stage them
        if let Some(pack) = &self.pack {
            if !self.vfs.is_directory(&archive_dir()) {
                pack.load_archives_into(&self.vfs);
            }
        }
        Ok(())
    }

    /// Compile `inputs` to a WebAssembly binary.
    pub fn compile(&mut self, inputs: impl Into<SourceSet>) -> CompileOutcome {
        let sources = inputs.into();
        let started = Instant::now();

        if self.state == DriverState::Compiling {
            let message = DriverError::Busy.to_string();
            self.handler.error(&message);
            return CompileOutcome {
                success: false,
                wasm: None,
                error: Some(message),
                metadata: CompileMetadata {
                    source_files: sources.len(),
                    ..Default::default()
                },
            };
        }

        self.state = DriverState::Compiling;
        self.cancel.store(false, Ordering::SeqCst);

        match self.compile_inner(&sources) {
            Ok((wasm, cache_hit)) => {
                self.state = DriverState::Complete;
                self.compiles += 1;
                if cache_hit {
                    self.cache_hits += 1;
                }
                CompileOutcome {
                    success: true,
                    metadata: CompileMetadata {
                        compile_time: started.elapsed(),
                        wasm_size: wasm.len() as u64,
                        source_files: sources.len(),
                        cache_hit,
                    },
                    wasm: Some(wasm),
                    error: None,
                }
            }
            Err(err) => {
                self.state = if matches!(err, DriverError::Cancelled) {
                    DriverState::Cancelled
                } else {
                    DriverState::Error
                };
                let message = err.to_string();
                tracing::warn!(error = %message, "compilation failed");
                self.handler.error(&message);
                CompileOutcome {
                    success: false,
                    wasm: None,
                    error: Some(message),
                    metadata: CompileMetadata {
                        compile_time: started.elapsed(),
                        source_files: sources.len(),
                        ..Default::default()
                    },
                }
            }
        }
    }

    fn compile_inner(&mut self, sources: &SourceSet) -> DriverResult<(Bytes, bool)> {
        self.run_stage(Stage::LoadToolchain, |d| d.ensure_toolchain())?;
        self.check_cancelled()?;

        let hash = hash_sources(sources);
        let cached = self.run_stage(Stage::CacheCheck, |d| Ok(d.artifact_cache.get(&hash)))?;
        if let Some(record) = cached {
            if is_wasm(&record.wasm) {
                tracing::debug!(hash = %hash, "artifact cache hit");
                self.handler.progress(100, "cached artifact");
                self.handler.complete(&record.wasm, &record.metadata);
                return Ok((record.wasm, true));
            }
            // hash collision or a corrupted record; rebuild from source
            tracing::warn!(hash = %hash, "cached artifact is not WebAssembly, rebuilding");
        }
        self.check_cancelled()?;

        let key = hash[..12].to_string();
        let work_dir = format!("/tmp/{key}");
        let input_paths = self.run_stage(Stage::StageSources, |d| {
            let mut paths = Vec::with_capacity(sources.len());
            for (path, content) in sources.iter() {
                let staged = format!("{}/{}", work_dir, path.trim_start_matches('/'));
                d.vfs.write_file(&staged, content.clone());
                paths.push(staged);
            }
            Ok(paths)
        })?;
        self.check_cancelled()?;

        self.run_stage(Stage::PrepareBuild, |d| {
            for dir in ["/tmp", "/build", "/output"] {
                d.vfs.create_dir(dir);
            }
            let info = serde_json::json!({
                "target": goscript_pack::ARCH_TARGET,
                "sources": &input_paths,
                "hash": &hash,
            });
            d.vfs.write_file("/build/build-info.json", info.to_string());
            Ok(())
        })?;
        self.check_cancelled()?;

        let pkg_dir = archive_dir();
        let object_path = format!("/build/{key}.o");
        self.run_stage(Stage::Compile, |d| {
            let mut argv = vec![
                "compile".to_string(),
                "-o".to_string(),
                object_path.clone(),
                "-p".to_string(),
                "main".to_string(),
                "-I".to_string(),
                pkg_dir.clone(),
            ];
            argv.extend(input_paths.iter().cloned());
            d.invoke_tool(Tool::Compiler, argv, &object_path)
        })?;
        self.check_cancelled()?;

        let wasm_path = format!("/build/{key}.wasm");
        let wasm = self.run_stage(Stage::Link, |d| {
            let argv = vec![
                "link".to_string(),
                "-o".to_string(),
                wasm_path.clone(),
                "-L".to_string(),
                pkg_dir.clone(),
                object_path.clone(),
            ];
            d.invoke_tool(Tool::Linker, argv, &wasm_path)?;
            let wasm = d
                .vfs
                .read_file(&wasm_path)
                .map_err(|_| DriverError::Link(format!("no output at {wasm_path}")))?
                .to_bytes();
            if !is_wasm(&wasm) {
                return Err(DriverError::Format);
            }
            Ok(wasm)
        })?;
        self.check_cancelled()?;

        let metadata = self.run_stage(Stage::Publish, |d| {
            let metadata = ArtifactMetadata::new(sources.total_bytes(), wasm.len() as u64);
            d.artifact_cache.put(
                &hash,
                &ArtifactRecord {
                    wasm: wasm.clone(),
                    metadata: metadata.clone(),
                },
            );
            d.vfs.write_file("/output/main.wasm", wasm.clone());
            Ok(metadata)
        })?;

        self.handler.progress(100, "complete");
        self.handler.complete(&wasm, &metadata);
        Ok((wasm, false))
    }

    fn run_stage<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut Self) -> DriverResult<T>,
    ) -> DriverResult<T> {
        self.handler.stage(stage, StageStatus::Started);
        self.handler.progress(stage.progress(), stage.name());
        tracing::debug!(stage = %stage, "stage start");
        match f(self) {
            Ok(value) => {
                self.handler.stage(stage, StageStatus::Finished);
                Ok(value)
            }
            Err(err) => {
                self.handler.stage(stage, StageStatus::Failed);
                Err(err)
            }
        }
    }

    fn invoke_tool(
        &mut self,
        tool: Tool,
        argv: Vec<String>,
        expected_output: &str,
    ) -> DriverResult<()> {
        let stdout = CaptureSink::new();
        let stderr = CaptureSink::new();
        let out_buffer = stdout.buffer();
        let err_buffer = stderr.buffer();

        let invocation = ToolInvocation {
            tool,
            argv,
            env: tool_env(),
            vfs: self.vfs.clone(),
            stdout: SharedSink::new(stdout),
            stderr: SharedSink::new(stderr),
        };
        let toolchain = self
            .toolchain
            .as_mut()
            .ok_or_else(|| DriverError::Compile("toolchain is not loaded".to_string()))?;
        let exit_code = toolchain.run_tool(invocation)?;

        let diagnostics = format!("{}{}", out_buffer.take(), err_buffer.take());
        if exit_code != 0 {
            return Err(tool_failure(
                tool,
                format!("exit code {exit_code}: {}", diagnostics.trim_end()),
            ));
        }
        if !self.vfs.is_file(expected_output) {
            return Err(tool_failure(
                tool,
                format!("declared output {expected_output} was not produced"),
            ));
        }
        Ok(())
    }

    /// Execute a previously produced binary and capture its output. The
    /// program runs over a fresh filesystem with its own output sinks.
    pub fn run(&mut self, wasm: &Bytes, options: RunOptions) -> RunOutcome {
        let mut store = Store::default();
        let module = match Module::new(&store, wasm.clone()) {
            Ok(module) => module,
            Err(e) => {
                let message = format!("binary does not load: {e}");
                self.handler.error(&message);
                return RunOutcome {
                    success: false,
                    output: String::new(),
                    error: Some(message),
                    exit_code: -1,
                };
            }
        };

        let capture = CaptureSink::new();
        let buffer = capture.buffer();
        let shared = SharedSink::new(capture);

        let mut runner = GoRunner::new(Vfs::new())
            .arg("main")
            .args(options.args)
            .envs(options.env)
            .stdout(shared.clone())
            .stderr(shared);
        if let Some(timeout) = self.tool_timeout {
            runner = runner.timeout(timeout);
        }

        let result = runner.run(&mut store, &module);
        let output = buffer.take();
        if !output.is_empty() {
            self.handler.output(&output);
        }
        match result {
            Ok(exit_code) => RunOutcome {
                success: exit_code == 0,
                error: (exit_code != 0).then(|| format!("program exited with code {exit_code}")),
                output,
                exit_code,
            },
            Err(e) => {
                let message = e.to_string();
                self.handler.error(&message);
                RunOutcome {
                    success: false,
                    output,
                    error: Some(message),
                    exit_code: -1,
                }
            }
        }
    }

    /// Flag the in-flight compilation; it stops at the next stage
    /// boundary. A running foreign module is not unwound.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel),
        }
    }

    fn check_cancelled(&mut self) -> DriverResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            state: self.state,
            vfs: self.vfs.stats(),
            packages: self.pack.as_ref().map(Pack::package_count).unwrap_or(0),
            compiles: self.compiles,
            cache_hits: self.cache_hits,
        }
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.pack
            .as_ref()
            .map(|p| p.has_package(name))
            .unwrap_or(false)
    }

    pub fn packages(&self) -> Vec<String> {
        self.pack
            .as_ref()
            .map(|p| p.package_names().to_vec())
            .unwrap_or_default()
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// Drop every staged file and return to `Idle`. The loaded pack
    /// survives; archives re-stage on the next compile.
    pub fn reset(&mut self) {
        self.vfs.clear();
        self.state = DriverState::Idle;
    }
}

fn tool_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("GOOS".to_string(), "js".to_string());
    env.insert("GOARCH".to_string(), "wasm".to_string());
    env.insert("GOROOT".to_string(), "/".to_string());
    env
}

fn tool_failure(tool: Tool, message: String) -> DriverError {
    match tool {
        Tool::Compiler => DriverError::Compile(message),
        Tool::Linker => DriverError::Link(message),
    }
}
