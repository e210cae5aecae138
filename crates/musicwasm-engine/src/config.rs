//! Engine configuration.
//!
//! Defaults, then an optional TOML file, then `MUSICWASM_*` environment
//! variables on top.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::sandbox::{env_parse, SandboxConfig};

/// Host identity forwarded to the module with every call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallContext {
    pub bundle_id: String,
    pub device_id: String,
    pub country_code: String,
    pub language_code: String,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            bundle_id: "io.musicwasm.host".to_string(),
            device_id: String::new(),
            country_code: "US".to_string(),
            language_code: "en".to_string(),
        }
    }
}

impl CallContext {
    fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("MUSICWASM_BUNDLE_ID") {
            self.bundle_id = v;
        }
        if let Ok(v) = std::env::var("MUSICWASM_DEVICE_ID") {
            self.device_id = v;
        }
        if let Ok(v) = std::env::var("MUSICWASM_COUNTRY_CODE") {
            self.country_code = v;
        }
        if let Ok(v) = std::env::var("MUSICWASM_LANGUAGE_CODE") {
            self.language_code = v;
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding downloaded module files, one `<id>.wasm` per version.
    pub cache_dir: PathBuf,
    /// Location of the module bundled with the host.
    pub embedded_path: PathBuf,
    /// Key/value state file (selected version, download flags).
    pub state_file: PathBuf,
    pub retry: RetryPolicy,
    pub sandbox: SandboxConfig,
    pub context: CallContext,
    /// Rebuild the instance from the same file after a trap.
    pub rebuild_on_trap: bool,
    /// Timeout of the stream reachability probe in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./data/wasm"),
            embedded_path: PathBuf::from("./resources/embedded.wasm"),
            state_file: PathBuf::from("./data/state.json"),
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::default(),
            context: CallContext::default(),
            rebuild_on_trap: true,
            probe_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Read a TOML config file, then apply environment overrides.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config.with_env())
    }

    fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("MUSICWASM_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MUSICWASM_EMBEDDED_PATH") {
            self.embedded_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MUSICWASM_STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(n) = env_parse("MUSICWASM_MAX_RETRIES") {
            self.retry.max_attempts = n;
        }
        if let Some(ms) = env_parse("MUSICWASM_RETRY_BASE_MS") {
            self.retry.base_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("MUSICWASM_RETRY_CAP_SECS") {
            self.retry.cap_ms = secs * 1000;
        }
        if let Ok(v) = std::env::var("MUSICWASM_REBUILD_ON_TRAP") {
            self.rebuild_on_trap = !v.eq_ignore_ascii_case("false");
        }
        if let Some(secs) = env_parse("MUSICWASM_PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = secs;
        }
        self.sandbox = self.sandbox.with_env();
        self.context = self.context.with_env();
        self
    }
}
