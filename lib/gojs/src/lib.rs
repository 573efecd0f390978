//! Host for Go `js/wasm` modules under wasmer.
//!
//! The foreign compiler and linker are ordinary Go programs compiled for
//! `GOOS=js GOARCH=wasm`; they expect the embedder to supply the `go`
//! import namespace, write argv and the environment into linear memory,
//! invoke the `run` export, and deliver callback and timer events through
//! the `resume` export until the program calls `runtime.wasmExit`.
//! [`GoRunner`] packages that protocol: configure argv/env/stdio, hand it
//! a compiled module, get the exit code back.
//!
//! ```no_run
//! use goscript_gojs::GoRunner;
//! use goscript_vfs::Vfs;
//! use wasmer::{Module, Store};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::default();
//! let module = Module::new(&store, std::fs::read("compile.wasm")?)?;
//! let vfs = Vfs::new();
//! let exit_code = GoRunner::new(vfs)
//!     .args(["compile", "-o", "/build/main.o", "/tmp/main.go"])
//!     .env("GOOS", "js")
//!     .run(&mut store, &module)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use wasmer::{Function, FunctionEnv, Instance, Memory, Module, Store, TypedFunction};

use goscript_vfs::{FsOps, NullSink, SharedSink, Vfs};

mod abi;
mod host;
mod imports;
mod values;

use host::JsHost;
use imports::{build_imports, DEADLINE_TRAP};

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),
    #[error("module is missing required export `{0}`")]
    MissingExport(&'static str),
    #[error("module trapped: {0}")]
    Trap(String),
    #[error("module execution exceeded the configured deadline")]
    Timeout,
    #[error("module neither exited nor scheduled further work")]
    NoExit,
    #[error("argv/env block overflows the region reserved by the module")]
    ArgsTooLarge,
    #[error("guest memory access out of bounds")]
    Memory(#[from] wasmer::MemoryAccessError),
}

/// Shared state of one module invocation, visible to every import.
pub(crate) struct GoEnv {
    pub(crate) memory: Option<Memory>,
    pub(crate) resume: Option<Function>,
    pub(crate) getsp: Option<TypedFunction<(), i32>>,
    pub(crate) host: JsHost,
    pub(crate) exited: bool,
    pub(crate) exit_code: i32,
    pub(crate) start: Instant,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timeouts: BTreeMap<i32, Instant>,
    pub(crate) next_timeout_id: i32,
}

/// Drives one Go `js/wasm` module from instantiation to exit.
#[derive(Debug)]
pub struct GoRunner {
    vfs: Vfs,
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    stdout: SharedSink,
    stderr: SharedSink,
    timeout: Option<Duration>,
}

impl GoRunner {
    pub fn new(vfs: Vfs) -> Self {
        Self {
            vfs,
            argv: Vec::new(),
            env: BTreeMap::new(),
            stdout: SharedSink::new(NullSink),
            stderr: SharedSink::new(NullSink),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn stdout(mut self, sink: SharedSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: SharedSink) -> Self {
        self.stderr = sink;
        self
    }

    /// Bound wall-clock execution. The deadline is observed at host-call
    /// boundaries and between timer events; there is no preemption of
    /// guest code that never calls out.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Instantiate `module`, write argv/env, run to exit and return the
    /// guest's exit code.
    pub fn run(self, store: &mut Store, module: &Module) -> RunnerResult<i32> {
        let fs = FsOps::new(self.vfs.clone())
            .with_stdout(self.stdout.clone())
            .with_stderr(self.stderr.clone());
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let genv = GoEnv {
            memory: None,
            resume: None,
            getsp: None,
            host: JsHost::new(fs),
            exited: false,
            exit_code: 0,
            start: Instant::now(),
            deadline,
            timeouts: BTreeMap::new(),
            next_timeout_id: 1,
        };
        let func_env = FunctionEnv::new(store, genv);
        let imports = build_imports(store, &func_env);

        let instance = Instance::new(store, module, &imports)
            .map_err(|e| RunnerError::Instantiate(e.to_string()))?;
        let memory = instance
            .exports
            .get_memory("mem")
            .map_err(|_| RunnerError::MissingExport("mem"))?
            .clone();
        let run: TypedFunction<(i32, i32), ()> = instance
            .exports
            .get_typed_function(store, "run")
            .map_err(|_| RunnerError::MissingExport("run"))?;
        let resume = instance
            .exports
            .get_function("resume")
            .map_err(|_| RunnerError::MissingExport("resume"))?
            .clone();
        let getsp: TypedFunction<(), i32> = instance
            .exports
            .get_typed_function(store, "getsp")
            .map_err(|_| RunnerError::MissingExport("getsp"))?;

        {
            let data = func_env.as_mut(store);
            data.memory = Some(memory.clone());
            data.resume = Some(resume.clone());
            data.getsp = Some(getsp);
        }

        let (argc, argv_ptr) = {
            let view = memory.view(&*store);
            abi::write_args_block(&view, &self.argv, &self.env)?
        };

        tracing::debug!(argv = ?self.argv, "running module");
        if let Err(trap) = run.call(store, argc, argv_ptr) {
            return Err(map_trap(trap));
        }

        // The program may have yielded instead of exiting; deliver timer
        // events until it calls wasmExit or runs out of scheduled work.
        loop {
            {
                let data = func_env.as_ref(store);
                if data.exited {
                    tracing::debug!(code = data.exit_code, "module exited");
                    return Ok(data.exit_code);
                }
            }

            let next = {
                let data = func_env.as_ref(store);
                data.timeouts
                    .iter()
                    .map(|(id, due)| (*id, *due))
                    .min_by_key(|(_, due)| *due)
            };
            let Some((id, due)) = next else {
                return Err(RunnerError::NoExit);
            };

            if let Some(deadline) = deadline {
                if due >= deadline {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                    return Err(RunnerError::Timeout);
                }
            }
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }

            func_env.as_mut(store).timeouts.remove(&id);
            if let Err(trap) = resume.call(store, &[]) {
                return Err(map_trap(trap));
            }
        }
    }
}

fn map_trap(trap: wasmer::RuntimeError) -> RunnerError {
    if trap.message().contains(DEADLINE_TRAP) {
        RunnerError::Timeout
    } else {
        RunnerError::Trap(trap.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goscript_vfs::CaptureSink;

    fn module(store: &Store, wat: &str) -> Module {
        let wasm = wat::parse_str(wat).expect("valid wat");
        Module::new(store, wasm).expect("valid module")
    }

    #[test]
    fn exit_code_is_returned() {
        let mut store = Store::default();
        let module = module(
            &store,
            r#"
            (module
              (import "go" "runtime.wasmExit" (func $exit (param i32)))
              (memory (export "mem") 4)
              (func (export "run") (param i32 i32)
                (i32.store (i32.const 8) (i32.const 7))
                (call $exit (i32.const 0)))
              (func (export "resume"))
              (func (export "getsp") (result i32) (i32.const 0)))
            "#,
        );

        let code = GoRunner::new(Vfs::new())
            .arg("tool")
            .run(&mut store, &module)
            .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn wasm_write_reaches_the_stderr_sink() {
        let mut store = Store::default();
        let module = module(
            &store,
            r#"
            (module
              (import "go" "runtime.wasmWrite" (func $write (param i32)))
              (import "go" "runtime.wasmExit" (func $exit (param i32)))
              (memory (export "mem") 4)
              (data (i32.const 4000) "oops")
              (func (export "run") (param i32 i32)
                ;; frame: fd i64 @8, ptr i64 @16, len i32 @24
                (i64.store (i32.const 8) (i64.const 2))
                (i64.store (i32.const 16) (i64.const 4000))
                (i32.store (i32.const 24) (i32.const 4))
                (call $write (i32.const 0))
                (i32.store (i32.const 8) (i32.const 1))
                (call $exit (i32.const 0)))
              (func (export "resume"))
              (func (export "getsp") (result i32) (i32.const 0)))
            "#,
        );

        let sink = CaptureSink::new();
        let buffer = sink.buffer();
        let code = GoRunner::new(Vfs::new())
            .arg("tool")
            .stderr(SharedSink::new(sink))
            .run(&mut store, &module)
            .unwrap();

        assert_eq!(code, 1);
        assert_eq!(buffer.contents(), "oops");
    }

    #[test]
    fn returning_without_exit_or_timers_is_an_error() {
        let mut store = Store::default();
        let module = module(
            &store,
            r#"
            (module
              (import "go" "runtime.wasmExit" (func $exit (param i32)))
              (memory (export "mem") 4)
              (func (export "run") (param i32 i32))
              (func (export "resume"))
              (func (export "getsp") (result i32) (i32.const 0)))
            "#,
        );

        let err = GoRunner::new(Vfs::new())
            .arg("tool")
            .run(&mut store, &module)
            .unwrap_err();
        assert!(matches!(err, RunnerError::NoExit));
    }

    #[test]
    fn scheduled_timeouts_resume_the_module() {
        let mut store = Store::default();
        // run() schedules a 1ms timer and yields; the resume delivery
        // exits with code 3.
        let module = module(
            &store,
            r#"
            (module
              (import "go" "runtime.scheduleTimeoutEvent" (func $sched (param i32)))
              (import "go" "runtime.wasmExit" (func $exit (param i32)))
              (memory (export "mem") 4)
              (func (export "run") (param i32 i32)
                (i64.store (i32.const 8) (i64.const 1))
                (call $sched (i32.const 0)))
              (func (export "resume")
                (i32.store (i32.const 8) (i32.const 3))
                (call $exit (i32.const 0)))
              (func (export "getsp") (result i32) (i32.const 0)))
            "#,
        );

        let code = GoRunner::new(Vfs::new())
            .arg("tool")
            .run(&mut store, &module)
            .unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn far_future_timer_hits_the_deadline() {
        let mut store = Store::default();
        let module = module(
            &store,
            r#"
            (module
              (import "go" "runtime.scheduleTimeoutEvent" (func $sched (param i32)))
              (import "go" "runtime.wasmExit" (func $exit (param i32)))
              (memory (export "mem") 4)
              (func (export "run") (param i32 i32)
                (i64.store (i32.const 8) (i64.const 60000))
                (call $sched (i32.const 0)))
              (func (export "resume"))
              (func (export "getsp") (result i32) (i32.const 0)))
            "#,
        );

        let err = GoRunner::new(Vfs::new())
            .arg("tool")
            .timeout(Duration::from_millis(20))
            .run(&mut store, &module)
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout));
    }

    #[test]
    fn missing_exports_are_reported() {
        let mut store = Store::default();
        let module = module(&store, r#"(module (memory (export "mem") 1))"#);

        let err = GoRunner::new(Vfs::new()).run(&mut store, &module).unwrap_err();
        assert!(matches!(err, RunnerError::MissingExport("run")));
    }
}
