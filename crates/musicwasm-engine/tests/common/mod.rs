// Shared fakes for engine integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use musicwasm_engine::codec::{self, encode_message};
use musicwasm_engine::{
    CallerId, Command, DownloadEvent, DownloadTask, Downloader, EngineCallId, EngineConfig,
    EngineError, EngineServices, EngineState, EngineVersion, ListTracks, MediaFormat,
    MemoryStore, ModuleLoader, MusicCallId, ReachabilityProbe, Result, Track, TrackDetails,
    WasmModule,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a fake module file contains: the version it reports and how it behaves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: String,
    pub next: Option<EngineVersion>,
    #[serde(default)]
    pub fail_init: bool,
}

impl ModuleSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_next(mut self, next: EngineVersion) -> Self {
        self.next = Some(next);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

/// Catalog module answering from its [`ModuleSpec`].
///
/// `search` with keyword `trap` traps; unknown calls echo their arguments.
pub struct FakeModule {
    spec: ModuleSpec,
    commands: Arc<Mutex<Vec<Command>>>,
}

#[async_trait]
impl WasmModule for FakeModule {
    async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let command: Command = codec::decode(&input)?;
        self.commands.lock().unwrap().push(command.clone());
        let call = command.call;

        if call.id == EngineCallId::Initialize.to_call_id() {
            if self.spec.fail_init {
                return Err(EngineError::Trap("initialize: unreachable".into()));
            }
            return encode_message(&());
        }
        if call.id == EngineCallId::GetVersion.to_call_id() {
            let mut version = EngineVersion::new(&self.spec.id, &self.spec.id, "module-reported");
            version.next = self.spec.next.clone().map(Box::new);
            return encode_message(&version);
        }
        if call.id == MusicCallId::Search.to_call_id() {
            let keyword = call.args["keyword"].as_str().unwrap_or_default();
            if keyword == "trap" {
                return Err(EngineError::Trap("wasm `unreachable` instruction executed".into()));
            }
            return encode_message(&ListTracks {
                items: vec![Track {
                    id: format!("{}:{keyword}", self.spec.id),
                    title: keyword.to_string(),
                    ..Default::default()
                }],
                continuation: None,
            });
        }
        if call.id == MusicCallId::GetDetails.to_call_id() {
            return encode_message(&TrackDetails {
                id: call.args["url"].as_str().unwrap_or_default().to_string(),
                formats: vec![MediaFormat {
                    url: "https://cdn.example/a.m4a".into(),
                    ..Default::default()
                }],
                ..Default::default()
            });
        }
        encode_message(&call.args)
    }

    async fn release(&self) {}
}

/// Loads [`FakeModule`]s from JSON spec files.
#[derive(Default)]
pub struct FakeLoader {
    pub loads: AtomicUsize,
    pub commands: Arc<Mutex<Vec<Command>>>,
}

impl FakeLoader {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleLoader for FakeLoader {
    async fn load(&self, path: &Path) -> Result<Box<dyn WasmModule>> {
        let bytes = tokio::fs::read(path).await?;
        let spec: ModuleSpec = serde_json::from_slice(&bytes)?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeModule {
            spec,
            commands: Arc::clone(&self.commands),
        }))
    }
}

/// Serves bodies by URL in four progress steps.
///
/// Stalled URLs report zero progress and then wait for cancellation.
#[derive(Default)]
pub struct FakeDownloader {
    pub bodies: Mutex<HashMap<String, Vec<u8>>>,
    pub stalled: Mutex<HashSet<String>>,
    pub tokens: Mutex<Vec<CancellationToken>>,
    pub calls: AtomicUsize,
}

impl FakeDownloader {
    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn stall(&self, url: &str) {
        self.stalled.lock().unwrap().insert(url.to_string());
    }

    /// Cancel handles of every download started so far.
    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, dest: &Path) -> DownloadTask {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.bodies.lock().unwrap().get(url).cloned();
        let stalled = self.stalled.lock().unwrap().contains(url);
        let (tx, task) = DownloadTask::channel();
        self.tokens.lock().unwrap().push(task.cancel.clone());
        let cancel = task.cancel.clone();
        let dest = dest.to_path_buf();
        let url = url.to_string();

        tokio::spawn(async move {
            if stalled {
                let _ = tx
                    .send(Ok(DownloadEvent::Progress {
                        current: 0,
                        total: Some(1024),
                    }))
                    .await;
                cancel.cancelled().await;
                let _ = tx.send(Err(EngineError::Cancelled)).await;
                return;
            }
            let Some(body) = body else {
                let _ = tx
                    .send(Err(EngineError::Download(format!("{url}: 404"))))
                    .await;
                return;
            };
            let total = body.len() as u64;
            for step in 1..=4u64 {
                let _ = tx
                    .send(Ok(DownloadEvent::Progress {
                        current: total * step / 4,
                        total: Some(total),
                    }))
                    .await;
            }
            match tokio::fs::write(&dest, &body).await {
                Ok(()) => {
                    let _ = tx.send(Ok(DownloadEvent::Success)).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                }
            }
        });

        task
    }
}

pub struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn is_reachable(&self, _url: &str) -> bool {
        true
    }
}

/// Everything an engine test needs, rooted in a temp directory.
pub struct TestHost {
    pub dir: tempfile::TempDir,
    pub config: EngineConfig,
    pub loader: Arc<FakeLoader>,
    pub downloader: Arc<FakeDownloader>,
    pub store: Arc<MemoryStore>,
}

impl TestHost {
    pub fn new(embedded: ModuleSpec) -> Self {
        Self::with_bundle_name(embedded, "embedded.wasm")
    }

    /// Host whose bundled module lives at `<dir>/<file_name>`.
    pub fn with_bundle_name(embedded: ModuleSpec, file_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            cache_dir: dir.path().join("wasm"),
            embedded_path: dir.path().join(file_name),
            state_file: dir.path().join("state.json"),
            ..Default::default()
        };
        std::fs::write(&config.embedded_path, embedded.to_bytes()).unwrap();

        Self {
            dir,
            config,
            loader: Arc::new(FakeLoader::default()),
            downloader: Arc::new(FakeDownloader::default()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn services(&self) -> EngineServices {
        EngineServices {
            loader: self.loader.clone(),
            downloader: self.downloader.clone(),
            store: self.store.clone(),
            probe: Arc::new(AlwaysReachable),
        }
    }

    pub fn engine(&self) -> musicwasm_engine::Engine {
        musicwasm_engine::Engine::new(self.config.clone(), self.services())
    }

    pub fn cache_path(&self, id: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{id}.wasm"))
    }

    /// Put a module file straight into the cache.
    pub fn cache(&self, spec: &ModuleSpec) {
        std::fs::create_dir_all(&self.config.cache_dir).unwrap();
        std::fs::write(self.cache_path(&spec.id), spec.to_bytes()).unwrap();
    }
}

pub fn remote(id: &str) -> EngineVersion {
    EngineVersion::new(id, format!("{id}.0"), format!("https://cdn.example/{id}.wasm"))
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<EngineState>) -> Vec<EngineState> {
    let mut states = Vec::new();
    while let Ok(state) = rx.try_recv() {
        states.push(state);
    }
    states
}

/// Wait until `rx` yields a state matching `pred`, collecting everything seen.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<EngineState>,
    pred: impl Fn(&EngineState) -> bool,
) -> Vec<EngineState> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(state) = rx.recv().await {
            let done = pred(&state);
            seen.push(state);
            if done {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for engine state");
    seen
}
