//! Instance wrapper — one loaded module and its call discipline.
//!
//! Calls are serialized through a FIFO async mutex, options are snapshotted
//! when a call is issued, and state changes are reported to a registered
//! delegate channel exactly once per transition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use serde::de::IgnoredAny;
use tokio::sync::{mpsc, OnceCell};
use uuid::Uuid;

use crate::call_id::EngineCallId;
use crate::codec::{self, ArgValue, CallEnvelope, CallOptions, Command, CONTENT_TYPE_CBOR};
use crate::config::CallContext;
use crate::error::{EngineError, Result};
use crate::sandbox::WasmModule;
use crate::version::EngineVersion;

/// Lifecycle of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Idle,
    Running,
    Trapped,
    Stopped,
}

/// Delivered to the delegate on every instance state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEvent {
    pub instance_id: Uuid,
    pub state: InstanceState,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct InstanceOptions {
    premium: bool,
    copts: BTreeMap<String, Vec<u8>>,
}

struct StateCell {
    state: InstanceState,
    delegate: Option<mpsc::UnboundedSender<InstanceEvent>>,
}

pub struct Instance {
    id: Uuid,
    path: PathBuf,
    module: tokio::sync::Mutex<Option<Box<dyn WasmModule>>>,
    context: CallContext,
    options: RwLock<InstanceOptions>,
    initialized: OnceCell<Vec<u8>>,
    state: Mutex<StateCell>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(module: Box<dyn WasmModule>, path: &Path, context: CallContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            module: tokio::sync::Mutex::new(Some(module)),
            context,
            options: RwLock::new(InstanceOptions::default()),
            initialized: OnceCell::new(),
            state: Mutex::new(StateCell {
                state: InstanceState::Idle,
                delegate: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// File the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> InstanceState {
        self.state
            .lock()
            .map(|cell| cell.state)
            .unwrap_or(InstanceState::Stopped)
    }

    /// Register the observer of state transitions, replacing any previous one.
    pub fn set_delegate(&self, delegate: mpsc::UnboundedSender<InstanceEvent>) {
        if let Ok(mut cell) = self.state.lock() {
            cell.delegate = Some(delegate);
        }
    }

    fn transition(&self, next: InstanceState, reason: Option<String>) {
        let Ok(mut cell) = self.state.lock() else {
            return;
        };
        if cell.state == next {
            return;
        }
        tracing::debug!(instance = %self.id, from = ?cell.state, to = ?next, "instance state changed");
        cell.state = next;
        // Sent under the lock so observers see transitions in order.
        if let Some(delegate) = &cell.delegate {
            let event = InstanceEvent {
                instance_id: self.id,
                state: next,
                reason,
            };
            if delegate.send(event).is_err() {
                cell.delegate = None;
            }
        }
    }

    // ── Options ──────────────────────────────────────────────────────

    /// Set a named option blob; applies from the next call issued.
    pub fn set_option(&self, name: &str, value: Vec<u8>) {
        if let Ok(mut options) = self.options.write() {
            options.copts.insert(name.to_string(), value);
        }
    }

    pub fn remove_option(&self, name: &str) {
        if let Ok(mut options) = self.options.write() {
            options.copts.remove(name);
        }
    }

    pub fn options(&self) -> BTreeMap<String, Vec<u8>> {
        self.options
            .read()
            .map(|o| o.copts.clone())
            .unwrap_or_default()
    }

    pub fn set_premium(&self, premium: bool) {
        if let Ok(mut options) = self.options.write() {
            options.premium = premium;
        }
    }

    pub fn premium(&self) -> bool {
        self.options.read().map(|o| o.premium).unwrap_or(false)
    }

    fn call_options(&self) -> CallOptions {
        let mut call_options = CallOptions {
            content_type: CONTENT_TYPE_CBOR.to_string(),
            bundle_id: self.context.bundle_id.clone(),
            device_id: self.context.device_id.clone(),
            country_code: self.context.country_code.clone(),
            language_code: self.context.language_code.clone(),
            ..Default::default()
        };

        if let Ok(options) = self.options.read() {
            call_options.premium = options.premium;
            for (name, blob) in &options.copts {
                match std::str::from_utf8(blob) {
                    Ok(text) => {
                        call_options
                            .extra
                            .insert(name.clone(), ArgValue::String(text.to_string()));
                    }
                    Err(_) => {
                        tracing::warn!(instance = %self.id, option = %name, "skipping non UTF-8 option blob");
                    }
                }
            }
        }

        call_options
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// One-time setup call. Later calls return the first result.
    pub async fn initialize(&self) -> Result<Vec<u8>> {
        self.initialized
            .get_or_try_init(|| async {
                let bytes = self
                    .invoke(CallEnvelope::new(EngineCallId::Initialize))
                    .await
                    .map_err(|e| EngineError::Initialization(e.to_string()))?;
                codec::decode::<IgnoredAny>(&bytes)
                    .map_err(|e| EngineError::Initialization(e.to_string()))?;
                Ok(bytes)
            })
            .await
            .cloned()
    }

    /// Initialize the module and mark the instance running.
    pub async fn start(&self) -> Result<()> {
        if self.state() == InstanceState::Stopped {
            return Err(EngineError::Call("instance stopped".into()));
        }
        self.initialize().await?;
        self.transition(InstanceState::Running, None);
        tracing::info!(instance = %self.id, path = %self.path.display(), "instance started");
        Ok(())
    }

    /// Wait for the in-flight call, then release the module.
    pub async fn stop(&self) {
        let module = self.module.lock().await.take();
        if let Some(module) = module {
            module.release().await;
            self.transition(InstanceState::Stopped, None);
            tracing::info!(instance = %self.id, "instance stopped");
        }
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// The generic invocation primitive.
    pub async fn call(&self, envelope: CallEnvelope) -> Result<Vec<u8>> {
        self.initialize().await?;
        self.invoke(envelope).await
    }

    async fn invoke(&self, envelope: CallEnvelope) -> Result<Vec<u8>> {
        let call_id = envelope.id.clone();
        let frame = codec::encode(&Command::call(envelope, self.call_options()))?;

        let guard = self.module.lock().await;
        let module = guard
            .as_ref()
            .ok_or_else(|| EngineError::Call("instance stopped".into()))?;

        let start = Instant::now();
        let result = module.call(frame).await;
        drop(guard);

        match &result {
            Ok(output) => {
                tracing::debug!(
                    instance = %self.id,
                    call_id = %call_id,
                    bytes = output.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "call completed"
                );
                if self.state() == InstanceState::Trapped {
                    self.transition(InstanceState::Running, None);
                }
            }
            Err(e) => {
                tracing::error!(instance = %self.id, call_id = %call_id, "call failed: {e}");
                if matches!(e, EngineError::Trap(_)) {
                    self.transition(InstanceState::Trapped, Some(e.to_string()));
                }
            }
        }

        result
    }

    /// The module's self-reported version, located at this instance's file.
    pub async fn version(&self) -> Result<EngineVersion> {
        let bytes = self
            .call(CallEnvelope::new(EngineCallId::GetVersion))
            .await?;
        let mut version: EngineVersion = codec::decode(&bytes)?;
        version.url = self.path.to_string_lossy().to_string();
        Ok(version)
    }
}
