//! MusicWasm Engine
//!
//! Host for a versioned music-catalog WASM module. The module runs in an
//! Extism (wasmtime) sandbox and is driven through one generic `call` export
//! carrying length-prefixed CBOR frames. On top of that primitive the engine
//! offers typed music operations, keeps module versions in a local cache, and
//! hot-swaps to newer versions while reporting its lifecycle to observers.

pub mod call_id;
pub mod codec;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod instance;
pub mod messages;
pub mod music;
pub mod probe;
pub mod retry;
pub mod sandbox;
pub mod state;
pub mod store;
pub mod updater;
pub mod version;

pub use call_id::{CallerId, EngineCallId, MusicCallId};
pub use codec::{decode, encode, ArgValue, CallEnvelope, CallOptions, Command};
pub use config::{CallContext, EngineConfig};
pub use downloader::{DownloadEvent, DownloadTask, Downloader, HttpDownloader};
pub use engine::{Engine, EngineServices, RefreshOutcome, UpdateMode};
pub use error::{EngineError, Result};
pub use instance::{Instance, InstanceEvent, InstanceState};
pub use messages::{
    ListOptions, ListSuggestions, ListTracks, MediaFormat, ModuleEvent, OptionEntry, Track,
    TrackDetails, Transcript, TranscriptLine,
};
pub use music::{MusicClient, MusicService};
pub use probe::{HttpProbe, ReachabilityProbe};
pub use retry::RetryPolicy;
pub use sandbox::{ExtismLoader, ModuleLoader, SandboxConfig, WasmModule};
pub use state::{EngineState, StateMachine};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoredValue};
pub use updater::Updater;
pub use version::EngineVersion;
