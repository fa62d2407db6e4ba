//! WebAssembly sandbox using Wasmtime.
//!
//! Functions are WebAssembly text modules. Each run gets a fresh store
//! with its own fuel and memory limits, so one invocation can never see
//! another's state, and a runaway function is stopped by fuel exhaustion
//! rather than by a wall clock.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fngate_http::{HttpExecutor, HttpRequest};
use wasmtime::{Caller, Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};

use crate::error::{Error, ExecutionError, SyntaxError};
use crate::traits::{FunctionResponse, RunOptions, Sandbox};

/// Resource limits applied to every invocation.
#[derive(Debug, Clone, Copy)]
pub struct SandboxConfig {
    /// Fuel units a single run may consume.
    pub fuel: u64,
    /// Upper bound on a run's linear memory, in bytes.
    pub max_memory_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel: 500_000_000,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

/// A compiled function.
#[derive(Clone)]
pub struct WasmScript {
    module: Module,
}

/// State held by the Wasmtime store for one run.
struct RunState {
    prefix: String,
    limits: StoreLimits,
    http: Arc<dyn HttpExecutor>,
}

/// Sandbox running WAT functions under Wasmtime.
///
/// Cloning is cheap; clones share the engine, the host functions and the
/// HTTP client.
#[derive(Clone)]
pub struct WasmSandbox {
    engine: Engine,
    linker: Arc<Linker<RunState>>,
    config: SandboxConfig,
    http: Arc<dyn HttpExecutor>,
}

impl WasmSandbox {
    pub fn new(config: SandboxConfig, http: Arc<dyn HttpExecutor>) -> Result<Self, Error> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        let engine = Engine::new(&engine_config).map_err(|e| Error::Engine {
            message: e.to_string(),
        })?;

        let mut linker = Linker::<RunState>::new(&engine);
        linker
            .func_wrap("env", "log", host_log)
            .map_err(|e| Error::HostFunction {
                name: "log".to_string(),
                message: e.to_string(),
            })?;
        linker
            .func_wrap("env", "fetch", host_fetch)
            .map_err(|e| Error::HostFunction {
                name: "fetch".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            config,
            http,
        })
    }

    pub fn config(&self) -> SandboxConfig {
        self.config
    }

    /// Run a compiled function on the calling thread.
    ///
    /// This blocks for as long as the function runs, including any
    /// outbound requests it makes. [`Sandbox::run_script`] moves it to the
    /// blocking pool.
    pub fn execute(
        &self,
        script: &WasmScript,
        request: &HttpRequest,
        options: &RunOptions,
    ) -> Result<FunctionResponse, ExecutionError> {
        let state = RunState {
            prefix: options.prefix.clone(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory_bytes)
                .build(),
            http: self.http.clone(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.fuel)
            .map_err(|e| ExecutionError::new(e.to_string()))?;

        let instance = self
            .linker
            .instantiate(&mut store, &script.module)
            .map_err(trap_to_error)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| ExecutionError::new("function does not export 'memory'"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| ExecutionError::new(e.to_string()))?;
        let handle = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "handle")
            .map_err(|e| ExecutionError::new(e.to_string()))?;

        let input = serde_json::to_vec(request).map_err(|e| ExecutionError::new(e.to_string()))?;
        let len = i32::try_from(input.len())
            .map_err(|_| ExecutionError::with_status(413, "request is too large"))?;

        let ptr = alloc.call(&mut store, len).map_err(trap_to_error)?;
        memory
            .write(&mut store, ptr as u32 as usize, &input)
            .map_err(|e| ExecutionError::new(format!("function allocated an invalid buffer: {}", e)))?;

        let packed = handle.call(&mut store, (ptr, len)).map_err(trap_to_error)?;
        let (out_ptr, out_len) = unpack(packed);
        if (out_ptr as usize).saturating_add(out_len as usize) > memory.data_size(&store) {
            return Err(ExecutionError::new(
                "function returned a response outside its memory",
            ));
        }

        let mut output = vec![0u8; out_len as usize];
        memory
            .read(&store, out_ptr as usize, &mut output)
            .map_err(|e| ExecutionError::new(format!("function returned an invalid buffer: {}", e)))?;

        serde_json::from_slice(&output)
            .map_err(|e| ExecutionError::new(format!("function returned an invalid response: {}", e)))
    }

    fn parse(filename: &str, code: &str) -> Result<Vec<u8>, String> {
        wat::parse_str(code).map_err(|mut e| {
            e.set_path(Path::new(filename));
            e.to_string()
        })
    }

    /// Parse and validate without compiling.
    pub fn check_syntax(&self, filename: &str, code: &str) -> Result<(), String> {
        let wasm = Self::parse(filename, code)?;
        Module::validate(&self.engine, &wasm).map_err(|e| e.to_string())
    }

    /// Compile on the calling thread.
    pub fn compile(&self, filename: &str, code: &str) -> Result<WasmScript, ExecutionError> {
        let wasm = Self::parse(filename, code).map_err(ExecutionError::new)?;
        let module =
            Module::new(&self.engine, &wasm).map_err(|e| ExecutionError::new(e.to_string()))?;

        for export in ["memory", "alloc", "handle"] {
            if module.get_export(export).is_none() {
                return Err(ExecutionError::new(format!(
                    "{} does not export '{}'",
                    filename, export
                )));
            }
        }

        tracing::debug!(filename, "Compiled function");
        Ok(WasmScript { module })
    }

    /// Run `f` with a clone of this sandbox on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, tokio::task::JoinError>
    where
        T: Send + 'static,
        F: FnOnce(WasmSandbox) -> T + Send + 'static,
    {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || f(sandbox)).await
    }
}

#[async_trait]
impl Sandbox for WasmSandbox {
    type Script = WasmScript;

    async fn test_syntax_error(
        &self,
        filename: &str,
        code: &str,
        options: &RunOptions,
    ) -> Option<SyntaxError> {
        let (name, source) = (filename.to_string(), code.to_string());
        let result = self
            .blocking(move |sandbox| sandbox.check_syntax(&name, &source))
            .await
            .unwrap_or_else(|e| Err(format!("syntax check failed: {}", e)));

        match result {
            Ok(()) => None,
            Err(message) => {
                tracing::debug!(prefix = %options.prefix, filename, "Rejected code: {}", message);
                Some(SyntaxError::new(filename, message))
            }
        }
    }

    async fn compile_code(&self, filename: &str, code: &str) -> Result<WasmScript, ExecutionError> {
        let (name, source) = (filename.to_string(), code.to_string());
        self.blocking(move |sandbox| sandbox.compile(&name, &source))
            .await
            .map_err(|e| ExecutionError::new(format!("compile task failed: {}", e)))?
    }

    async fn run_script(
        &self,
        script: Arc<WasmScript>,
        request: HttpRequest,
        options: &RunOptions,
    ) -> Result<FunctionResponse, ExecutionError> {
        let options = options.clone();
        self.blocking(move |sandbox| sandbox.execute(&script, &request, &options))
            .await
            .map_err(|e| ExecutionError::new(format!("function task failed: {}", e)))?
    }
}

fn trap_to_error(error: wasmtime::Error) -> ExecutionError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            ExecutionError::with_status(408, "function exceeded its execution budget")
        }
        _ => ExecutionError::new(error.to_string()),
    }
}

fn pack(ptr: i32, len: i32) -> i64 {
    (((ptr as u32 as u64) << 32) | len as u32 as u64) as i64
}

fn unpack(packed: i64) -> (u32, u32) {
    let packed = packed as u64;
    ((packed >> 32) as u32, packed as u32)
}

fn read_guest(caller: &mut Caller<'_, RunState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = caller.get_export("memory")?.into_memory()?;
    let (start, len) = (ptr as u32 as usize, usize::try_from(len).ok()?);
    if start.saturating_add(len) > memory.data_size(&*caller) {
        return None;
    }
    let mut buf = vec![0u8; len];
    memory.read(&*caller, start, &mut buf).ok()?;
    Some(buf)
}

/// Copy `bytes` into a buffer from the guest's `alloc`.
fn write_guest(caller: &mut Caller<'_, RunState>, bytes: &[u8]) -> Option<i64> {
    let alloc = caller
        .get_export("alloc")?
        .into_func()?
        .typed::<i32, i32>(&*caller)
        .ok()?;
    let memory = caller.get_export("memory")?.into_memory()?;
    let len = i32::try_from(bytes.len()).ok()?;
    let ptr = alloc.call(&mut *caller, len).ok()?;
    memory.write(&mut *caller, ptr as u32 as usize, bytes).ok()?;
    Some(pack(ptr, len))
}

fn host_log(mut caller: Caller<'_, RunState>, ptr: i32, len: i32) {
    let prefix = caller.data().prefix.clone();
    match read_guest(&mut caller, ptr, len) {
        Some(bytes) => {
            tracing::info!(prefix = %prefix, "{}", String::from_utf8_lossy(&bytes));
        }
        None => tracing::warn!(prefix = %prefix, ptr, len, "Function logged an invalid buffer"),
    }
}

fn host_fetch(mut caller: Caller<'_, RunState>, ptr: i32, len: i32) -> i64 {
    let prefix = caller.data().prefix.clone();

    let Some(bytes) = read_guest(&mut caller, ptr, len) else {
        tracing::warn!(prefix = %prefix, ptr, len, "Function fetched with an invalid buffer");
        return 0;
    };
    let request: HttpRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(prefix = %prefix, "Function fetched with an invalid request: {}", e);
            return 0;
        }
    };

    let http = caller.data().http.clone();
    let response = match http.execute(&request) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(prefix = %prefix, url = %request.path, "Fetch failed: {}", e);
            return 0;
        }
    };

    let Ok(payload) = serde_json::to_vec(&response) else {
        return 0;
    };
    write_guest(&mut caller, &payload).unwrap_or(0)
}
