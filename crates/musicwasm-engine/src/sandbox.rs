//! WASM runtime seam and its Extism (wasmtime) implementation.
//!
//! The engine only needs `call(bytes) -> bytes` from a loaded module. The
//! [`ModuleLoader`] / [`WasmModule`] traits keep that seam explicit; the
//! Extism-backed implementation runs each module in its own sandbox with a
//! memory limit, an optional fuel limit and a per-call timeout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{EngineError, Result};

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Default max WASM binary size: 50 MB.
const DEFAULT_MAX_WASM_SIZE_MB: u64 = 50;

/// Export every module implements as its single entry point.
pub const CALL_EXPORT: &str = "call";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism kernel
    "extism:host/user",       // Extism user host functions
    "wasi_snapshot_preview1", // WASI preview 1 (when enabled)
    "wasi_unstable",          // Legacy WASI
];

// ─── Runtime seam ───────────────────────────────────────────────────────

/// A loaded module exposing the single generic call primitive.
///
/// Implementations need not be safe for concurrent calls; the instance
/// wrapper serializes them.
#[async_trait]
pub trait WasmModule: Send + Sync {
    async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>>;

    /// Abort pending work and free runtime resources.
    async fn release(&self);
}

/// Loads module files into runnable [`WasmModule`]s.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<Box<dyn WasmModule>>;
}

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 256 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call; `None` disables metering.
    pub fuel_limit: Option<u64>,
    /// Wall-clock limit for a single call in seconds (default: 30).
    pub call_timeout_secs: u64,
    /// Whether to enable WASI (default: false).
    pub wasi_enabled: bool,
    /// Hosts the module may reach through the runtime's HTTP host function.
    pub allowed_hosts: Vec<String>,
    /// Maximum module size in bytes (default: 50 MB).
    pub max_wasm_size: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 256 * 1024 * 1024,
            fuel_limit: None,
            call_timeout_secs: 30,
            wasi_enabled: false,
            allowed_hosts: vec!["*".to_string()],
            max_wasm_size: DEFAULT_MAX_WASM_SIZE_MB * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Apply `MUSICWASM_*` sandbox variables on top of this config.
    pub fn with_env(mut self) -> Self {
        if let Some(mb) = env_parse::<usize>("MUSICWASM_MEMORY_LIMIT_MB") {
            self.memory_limit = mb * 1024 * 1024;
        }
        if let Some(fuel) = env_parse::<u64>("MUSICWASM_FUEL_LIMIT") {
            self.fuel_limit = (fuel > 0).then_some(fuel);
        }
        if let Some(secs) = env_parse("MUSICWASM_CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("MUSICWASM_WASI_ENABLED") {
            self.wasi_enabled = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("MUSICWASM_ALLOWED_HOSTS") {
            self.allowed_hosts = v
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(mb) = env_parse::<u64>("MUSICWASM_MAX_WASM_SIZE_MB") {
            self.max_wasm_size = mb * 1024 * 1024;
        }
        self
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ─── Validation ─────────────────────────────────────────────────────────

/// Validate a module binary before handing it to the runtime.
///
/// Checks:
/// 1. Size within limits
/// 2. Magic bytes (0x00 0x61 0x73 0x6D = "\0asm")
/// 3. Import analysis: only allowed namespaces
pub fn validate_module(wasm_bytes: &[u8], max_size: u64) -> Result<()> {
    if wasm_bytes.len() as u64 > max_size {
        return Err(EngineError::WasmValidation(format!(
            "WASM binary too large: {} bytes (max: {} bytes)",
            wasm_bytes.len(),
            max_size
        )));
    }

    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(EngineError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    validate_imports(wasm_bytes)
}

fn validate_imports(wasm_bytes: &[u8]) -> Result<()> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| EngineError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    EngineError::WasmValidation(format!("failed to read import: {e}"))
                })?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(EngineError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }

    Ok(())
}

// ─── Extism implementation ──────────────────────────────────────────────

/// Loads modules into Extism sandboxes.
#[derive(Debug, Clone, Default)]
pub struct ExtismLoader {
    config: SandboxConfig,
}

impl ExtismLoader {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ModuleLoader for ExtismLoader {
    async fn load(&self, path: &Path) -> Result<Box<dyn WasmModule>> {
        let wasm_bytes = tokio::fs::read(path).await?;
        validate_module(&wasm_bytes, self.config.max_wasm_size)?;

        let config = self.config.clone();
        let owned_path = path.to_path_buf();
        let module = tokio::task::spawn_blocking(move || {
            ExtismModule::build(wasm_bytes, config, owned_path)
        })
        .await
        .map_err(|e| EngineError::Sandbox(format!("module build task failed: {e}")))??;

        Ok(Box::new(module))
    }
}

/// A module running inside an Extism plugin.
pub struct ExtismModule {
    plugin: Arc<Mutex<extism::Plugin>>,
    cancel: extism::CancelHandle,
    path: PathBuf,
}

impl std::fmt::Debug for ExtismModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtismModule")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ExtismModule {
    fn build(wasm_bytes: Vec<u8>, config: SandboxConfig, path: PathBuf) -> Result<Self> {
        let mut manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((config.memory_limit / 65536) as u32)
            .with_timeout(Duration::from_secs(config.call_timeout_secs));
        for host in &config.allowed_hosts {
            manifest = manifest.with_allowed_host(host.clone());
        }

        let mut builder = extism::PluginBuilder::new(manifest).with_wasi(config.wasi_enabled);
        if let Some(fuel) = config.fuel_limit {
            builder = builder.with_fuel_limit(fuel);
        }

        if config.wasi_enabled {
            tracing::warn!(
                path = %path.display(),
                "WASI enabled for module; it can read environment variables"
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| EngineError::Sandbox(e.to_string()))?;

        if !plugin.function_exists(CALL_EXPORT) {
            return Err(EngineError::Sandbox(format!(
                "module does not export `{CALL_EXPORT}`"
            )));
        }

        let cancel = plugin.cancel_handle();
        tracing::debug!(path = %path.display(), "module sandbox built");

        Ok(Self {
            plugin: Arc::new(Mutex::new(plugin)),
            cancel,
            path,
        })
    }
}

/// Map a runtime failure onto the engine's call error kinds.
fn classify_call_error(message: String) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("fuel") {
        EngineError::Timeout(message)
    } else if lower.contains("trap")
        || lower.contains("unreachable")
        || lower.contains("out of bounds")
        || lower.contains("stack overflow")
    {
        EngineError::Trap(message)
    } else {
        EngineError::Call(message)
    }
}

#[async_trait]
impl WasmModule for ExtismModule {
    async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let plugin = Arc::clone(&self.plugin);
        tokio::task::spawn_blocking(move || {
            let mut plugin = plugin
                .lock()
                .map_err(|_| EngineError::Call("module lock poisoned".into()))?;
            plugin
                .call::<&[u8], Vec<u8>>(CALL_EXPORT, &input)
                .map_err(|e| classify_call_error(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Call(format!("call task failed: {e}")))?
    }

    async fn release(&self) {
        if let Err(e) = self.cancel.cancel() {
            tracing::warn!(path = %self.path.display(), "failed to cancel module: {e}");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
