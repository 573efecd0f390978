//! Tool execution behind a seam.
//!
//! The driver invokes the compiler and linker through the [`Toolchain`]
//! trait so embedders and tests can substitute the execution engine;
//! [`WasmToolchain`] is the production implementation, instantiating the
//! pack's modules under wasmer via [`goscript_gojs::GoRunner`].

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use wasmer::{Module, Store};

use goscript_gojs::{GoRunner, RunnerError};
use goscript_vfs::{SharedSink, Vfs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Compiler,
    Linker,
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tool::Compiler => f.write_str("compiler"),
            Tool::Linker => f.write_str("linker"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("failed to load the {tool} module: {message}")]
    Module { tool: Tool, message: String },
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// One tool invocation: the argument vector and environment the tool
/// parses, the filesystem it works over, and the sinks receiving its
/// stdio.
#[derive(Debug)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub vfs: Vfs,
    pub stdout: SharedSink,
    pub stderr: SharedSink,
}

pub trait Toolchain: Send {
    /// Run one tool to completion and return its exit code.
    fn run_tool(&mut self, invocation: ToolInvocation) -> Result<i32, ToolchainError>;
}

/// Runs the pack's compiler and linker modules under wasmer. Each module
/// is compiled by the engine once and reused across invocations.
pub struct WasmToolchain {
    store: Store,
    compiler_bytes: Bytes,
    linker_bytes: Bytes,
    compiler: Option<Module>,
    linker: Option<Module>,
    timeout: Option<Duration>,
}

impl WasmToolchain {
    pub fn new(compiler_bytes: Bytes, linker_bytes: Bytes) -> Self {
        Self {
            store: Store::default(),
            compiler_bytes,
            linker_bytes,
            compiler: None,
            linker: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn module(&mut self, tool: Tool) -> Result<Module, ToolchainError> {
        let (slot, bytes) = match tool {
            Tool::Compiler => (&mut self.compiler, &self.compiler_bytes),
            Tool::Linker => (&mut self.linker, &self.linker_bytes),
        };
        if let Some(module) = slot {
            return Ok(module.clone());
        }
        tracing::debug!(%tool, len = bytes.len(), "compiling tool module");
        let module = Module::new(&self.store, bytes.clone()).map_err(|e| ToolchainError::Module {
            tool,
            message: e.to_string(),
        })?;
        *slot = Some(module.clone());
        Ok(module)
    }
}

impl Toolchain for WasmToolchain {
    fn run_tool(&mut self, invocation: ToolInvocation) -> Result<i32, ToolchainError> {
        let module = self.module(invocation.tool)?;
        let mut runner = GoRunner::new(invocation.vfs)
            .args(invocation.argv)
            .envs(invocation.env)
            .stdout(invocation.stdout)
            .stderr(invocation.stderr);
        if let Some(timeout) = self.timeout {
            runner = runner.timeout(timeout);
        }
        Ok(runner.run(&mut self.store, &module)?)
    }
}

impl std::fmt::Debug for WasmToolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmToolchain")
            .field("compiler_bytes", &self.compiler_bytes.len())
            .field("linker_bytes", &self.linker_bytes.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
