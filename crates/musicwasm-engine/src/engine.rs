//! Engine — owns the active instance and drives its lifecycle.
//!
//! The `Engine` is constructed by the host with its collaborators injected
//! (module loader, downloader, state store, stream probe). It loads the
//! selected module version, hot-swaps to newer versions, rebuilds an instance
//! after a trap, and routes typed music calls to whichever instance is active.
//! Lifecycle operations are serialized; music calls are not, and each keeps
//! its own handle on the instance it started with.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::downloader::{DownloadEvent, DownloadTask, Downloader, HttpDownloader};
use crate::error::{EngineError, Result};
use crate::instance::{Instance, InstanceEvent, InstanceState};
use crate::messages::{ListOptions, ListSuggestions, ListTracks, TrackDetails, Transcript};
use crate::music::{MusicClient, MusicService};
use crate::probe::{HttpProbe, ReachabilityProbe};
use crate::sandbox::{ExtismLoader, ModuleLoader};
use crate::state::{EngineState, StateMachine};
use crate::store::{JsonFileStore, KeyValueStore, StoredValue, SELECTED_VERSION_KEY};
use crate::updater::Updater;
use crate::version::EngineVersion;

// ─── Services ───────────────────────────────────────────────────────────

/// Collaborators the engine is built with.
#[derive(Clone)]
pub struct EngineServices {
    pub loader: Arc<dyn ModuleLoader>,
    pub downloader: Arc<dyn Downloader>,
    pub store: Arc<dyn KeyValueStore>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

impl EngineServices {
    /// Extism runtime, HTTP downloader and probe, JSON state file.
    pub fn production(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            loader: Arc::new(ExtismLoader::new(config.sandbox.clone())),
            downloader: Arc::new(HttpDownloader::default()),
            store: Arc::new(JsonFileStore::open(&config.state_file)?),
            probe: Arc::new(HttpProbe::new(Duration::from_secs(
                config.probe_timeout_secs,
            ))),
        })
    }
}

/// What [`Engine::refresh`] does when a newer version is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Download and activate it right away.
    #[default]
    Automatic,
    /// Only report it.
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    UpToDate(EngineVersion),
    UpdateAvailable(EngineVersion),
    Updated(EngineVersion),
}

// ─── Engine ─────────────────────────────────────────────────────────────

struct Active {
    instance: Arc<Instance>,
    version: EngineVersion,
}

#[derive(Default)]
struct HostOptions {
    premium: bool,
    copts: BTreeMap<String, Vec<u8>>,
}

struct EngineInner {
    config: EngineConfig,
    services: EngineServices,
    updater: Updater,
    state: StateMachine,
    /// The instance serving calls. Swapped only under `lifecycle`.
    active: RwLock<Option<Active>>,
    /// Serializes load / update / activate / remove / release / rebuild.
    lifecycle: tokio::sync::Mutex<()>,
    /// Re-applied to every instance the engine creates.
    options: Mutex<HostOptions>,
}

/// Host-owned handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("active_version", &self.active_version().map(|v| v.id))
            .finish_non_exhaustive()
    }
}

/// Same failure for observers and for the caller.
fn duplicate(error: &EngineError) -> EngineError {
    match error {
        EngineError::Cancelled => EngineError::Cancelled,
        EngineError::Download(m) => EngineError::Download(m.clone()),
        EngineError::Activation(m) => EngineError::Activation(m.clone()),
        other => EngineError::Activation(other.to_string()),
    }
}

/// Moves the engine to `Failed(Cancelled)` when a lifecycle future is dropped
/// while the state is still transitional, and aborts its download.
struct PendingTransition<'a> {
    engine: &'a Engine,
    download: Option<CancellationToken>,
    settled: bool,
}

impl<'a> PendingTransition<'a> {
    fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            download: None,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(download) = &self.download {
            download.cancel();
        }
        let state = self.engine.state();
        if matches!(
            state,
            EngineState::Starting | EngineState::Updating { .. } | EngineState::Reloading(_)
        ) {
            tracing::warn!(state = %state, "lifecycle operation dropped before completion");
            self.engine.fail(EngineError::Cancelled);
        }
    }
}

impl Engine {
    pub fn new(config: EngineConfig, services: EngineServices) -> Self {
        let updater = Updater::new(
            config.cache_dir.clone(),
            config.embedded_path.clone(),
            Arc::clone(&services.downloader),
            Arc::clone(&services.store),
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                services,
                updater,
                state: StateMachine::new(),
                active: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                options: Mutex::new(HostOptions::default()),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.current()
    }

    /// Current state first, then every transition in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn updater(&self) -> &Updater {
        &self.inner.updater
    }

    pub fn active_version(&self) -> Option<EngineVersion> {
        self.inner
            .active
            .read()
            .ok()?
            .as_ref()
            .map(|a| a.version.clone())
    }

    fn active_instance(&self) -> Option<Arc<Instance>> {
        self.inner
            .active
            .read()
            .ok()?
            .as_ref()
            .map(|a| Arc::clone(&a.instance))
    }

    /// Typed client on the active instance.
    pub fn client(&self) -> Result<MusicClient> {
        let instance = self.active_instance().ok_or(EngineError::NotRunning)?;
        Ok(MusicClient::new(
            instance,
            Arc::clone(&self.inner.services.probe),
            self.inner.config.retry,
        ))
    }

    // ── Selection persistence ────────────────────────────────────────

    fn selected_version(&self) -> Option<EngineVersion> {
        let raw = self.inner.services.store.get_string(SELECTED_VERSION_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::warn!("ignoring unreadable selected version: {e}");
                None
            }
        }
    }

    fn persist_selection(&self, version: &EngineVersion) {
        let store = &self.inner.services.store;
        let result = if version.is_embedded() {
            store.remove(SELECTED_VERSION_KEY)
        } else {
            serde_json::to_string(version)
                .map_err(EngineError::from)
                .and_then(|json| store.set(SELECTED_VERSION_KEY, StoredValue::String(json)))
        };
        if let Err(e) = result {
            tracing::warn!(version = %version.id, "failed to persist selected version: {e}");
        }
    }

    fn embedded_version(&self) -> EngineVersion {
        EngineVersion::embedded_at(&self.inner.config.embedded_path)
    }

    /// Persisted selection when its file is still cached, else embedded.
    async fn resolve_selection(&self) -> EngineVersion {
        let Some(selected) = self.selected_version() else {
            return self.embedded_version();
        };
        if self.inner.updater.exists(&selected).await {
            return selected;
        }
        tracing::warn!(version = %selected.id, "selected version missing from cache, using embedded");
        self.embedded_version()
    }

    // ── Instance construction ────────────────────────────────────────

    async fn spawn_instance(&self, version: &EngineVersion) -> Result<Arc<Instance>> {
        let path = self.inner.updater.path_for(version)?;
        let module = self.inner.services.loader.load(&path).await?;
        let instance = Arc::new(Instance::new(
            module,
            &path,
            self.inner.config.context.clone(),
        ));

        if let Ok(options) = self.inner.options.lock() {
            instance.set_premium(options.premium);
            for (name, value) in &options.copts {
                instance.set_option(name, value.clone());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        instance.set_delegate(tx);

        if let Err(e) = instance.start().await {
            instance.stop().await;
            return Err(e);
        }

        spawn_watcher(Arc::downgrade(&self.inner), instance.id(), rx);
        Ok(instance)
    }

    /// Swap in `instance` and stop whichever one it replaces.
    async fn install(&self, instance: Arc<Instance>, version: EngineVersion) -> Result<()> {
        let previous = {
            let mut active = self
                .inner
                .active
                .write()
                .map_err(|_| EngineError::Activation("active instance lock poisoned".into()))?;
            active.replace(Active {
                instance,
                version: version.clone(),
            })
        };

        self.persist_selection(&version);
        self.inner.state.transition(EngineState::Running(version.clone()))?;
        tracing::info!(version = %version.id, "engine running");

        if let Some(previous) = previous {
            // Waits for its in-flight call.
            previous.instance.stop().await;
            tracing::debug!(version = %previous.version.id, "previous instance stopped");
        }
        Ok(())
    }

    fn fail(&self, error: EngineError) -> EngineError {
        tracing::error!("engine failed: {error}");
        let shared = Arc::new(duplicate(&error));
        if let Err(e) = self.inner.state.transition(EngineState::Failed(shared)) {
            tracing::warn!("could not record failure: {e}");
        }
        duplicate(&error)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load `requested`, else the persisted selection, else the embedded module.
    pub async fn load(&self, requested: Option<EngineVersion>) -> Result<EngineVersion> {
        let _guard = self.inner.lifecycle.lock().await;

        let version = match requested {
            Some(version) => version,
            None => self.resolve_selection().await,
        };

        let entering = if self.state().is_running() {
            EngineState::Reloading(version.clone())
        } else {
            EngineState::Starting
        };
        self.inner.state.transition(entering)?;
        let pending = PendingTransition::new(self);
        let result = self.load_locked(version).await;
        pending.settle();
        result
    }

    async fn load_locked(&self, version: EngineVersion) -> Result<EngineVersion> {
        tracing::info!(version = %version.id, url = %version.url, "loading engine");

        if let Err(e) = self.inner.updater.prepare().await {
            return Err(self.fail(e));
        }

        match self.spawn_instance(&version).await {
            Ok(instance) => {
                self.install(instance, version.clone()).await?;
                Ok(version)
            }
            Err(e) => Err(self.fail(EngineError::Activation(format!(
                "failed to load version {}: {e}",
                version.id
            )))),
        }
    }

    /// Ask the running module for its successor version.
    pub async fn check_for_update(&self) -> Result<Option<EngineVersion>> {
        let instance = self.active_instance().ok_or(EngineError::NotRunning)?;
        let current = instance.version().await?;
        let next = current.next.map(|next| *next);
        match &next {
            Some(next) => tracing::info!(current = %current.id, next = %next.id, "update available"),
            None => tracing::debug!(current = %current.id, "engine up to date"),
        }
        Ok(next)
    }

    /// Fetch a version into the cache without activating it.
    pub async fn download(&self, version: &EngineVersion) -> DownloadTask {
        self.inner.updater.download(version).await
    }

    /// Download `version` with progress, then activate it.
    pub async fn update(&self, version: EngineVersion) -> Result<()> {
        self.update_with_cancel(version, CancellationToken::new())
            .await
    }

    pub async fn update_with_cancel(
        &self,
        version: EngineVersion,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        self.inner.state.transition(EngineState::Updating {
            version: version.clone(),
            progress: 0.0,
        })?;
        let mut pending = PendingTransition::new(self);
        tracing::info!(version = %version.id, "updating engine");

        let mut task = self.inner.updater.download(&version).await;
        pending.download = Some(task.cancel.clone());
        let result = self.follow_update(version, &mut task, &cancel).await;
        pending.settle();
        result
    }

    /// Caller holds `lifecycle` and has moved the state to `Updating`.
    async fn follow_update(
        &self,
        version: EngineVersion,
        task: &mut DownloadTask,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cancel_sent = false;
        let mut succeeded = false;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled(), if !cancel_sent => {
                    task.cancel.cancel();
                    cancel_sent = true;
                    continue;
                }
                event = task.events.recv() => event,
            };

            match event {
                Some(Ok(DownloadEvent::Success)) => {
                    succeeded = true;
                    break;
                }
                Some(Ok(progress)) => {
                    if let Some(fraction) = progress.fraction() {
                        self.inner.state.transition(EngineState::Updating {
                            version: version.clone(),
                            progress: fraction,
                        })?;
                    }
                }
                Some(Err(e)) => {
                    let e = match e {
                        EngineError::Cancelled | EngineError::Download(_) => e,
                        other => EngineError::Download(other.to_string()),
                    };
                    return Err(self.fail(e));
                }
                None => break,
            }
        }

        if !succeeded {
            return Err(self.fail(EngineError::Download(format!(
                "download of version {} ended without success",
                version.id
            ))));
        }

        self.inner.state.transition(EngineState::Updating {
            version: version.clone(),
            progress: 1.0,
        })?;
        self.inner
            .state
            .transition(EngineState::Reloading(version.clone()))?;
        self.activate_locked(version).await
    }

    /// Switch to an already cached version.
    pub async fn activate(&self, version: EngineVersion) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner
            .state
            .transition(EngineState::Reloading(version.clone()))?;
        let pending = PendingTransition::new(self);
        let result = self.activate_locked(version).await;
        pending.settle();
        result
    }

    /// Caller holds `lifecycle` and has moved the state to `Reloading`.
    async fn activate_locked(&self, version: EngineVersion) -> Result<()> {
        match self.spawn_instance(&version).await {
            Ok(instance) => self.install(instance, version).await,
            Err(e) => {
                // The previous instance, if any, keeps serving.
                Err(self.fail(EngineError::Activation(format!(
                    "failed to activate version {}: {e}",
                    version.id
                ))))
            }
        }
    }

    /// Load if needed, then look for a successor and act on it per `mode`.
    pub async fn refresh(&self, mode: UpdateMode) -> Result<RefreshOutcome> {
        if self.active_instance().is_none() {
            self.load(None).await?;
        }

        let Some(next) = self.check_for_update().await? else {
            let current = self.active_version().ok_or(EngineError::NotRunning)?;
            return Ok(RefreshOutcome::UpToDate(current));
        };

        // Skip straight to the newest announced version.
        let mut latest = next.latest().clone();
        latest.next = None;
        if latest.id != next.id {
            tracing::info!(next = %next.id, latest = %latest.id, "skipping intermediate versions");
        }

        match mode {
            UpdateMode::Automatic => {
                self.update(latest.clone()).await?;
                Ok(RefreshOutcome::Updated(latest))
            }
            UpdateMode::Manual => Ok(RefreshOutcome::UpdateAvailable(latest)),
        }
    }

    /// Delete a cached version, clearing the selection if it pointed at it.
    ///
    /// The active version is refused with [`EngineError::InUse`]; activate
    /// another one or release the engine first.
    pub async fn remove(&self, version: &EngineVersion) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if !version.is_embedded()
            && self.active_version().is_some_and(|active| active.id == version.id)
        {
            return Err(EngineError::InUse(version.id.clone()));
        }
        self.inner.updater.remove(version).await?;

        if self.selected_version().is_some_and(|s| s.id == version.id) {
            self.inner.services.store.remove(SELECTED_VERSION_KEY)?;
        }
        Ok(())
    }

    /// Stop the active instance and return to `Stopped`.
    pub async fn release(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.state() == EngineState::Stopped && self.active_instance().is_none() {
            return Ok(());
        }

        self.inner.state.transition(EngineState::Releasing)?;
        let previous = self
            .inner
            .active
            .write()
            .map_err(|_| EngineError::Activation("active instance lock poisoned".into()))?
            .take();
        if let Some(previous) = previous {
            previous.instance.stop().await;
        }
        self.inner.state.transition(EngineState::Stopped)?;
        tracing::info!("engine released");
        Ok(())
    }

    /// Rebuild the trapped instance `instance_id` from its own file.
    async fn rebuild(&self, instance_id: Uuid) {
        let _guard = self.inner.lifecycle.lock().await;

        let version = match self.inner.active.read() {
            Ok(active) => match active.as_ref() {
                Some(a) if a.instance.id() == instance_id => a.version.clone(),
                _ => return,
            },
            Err(_) => return,
        };
        if !self.state().is_running() {
            tracing::debug!(version = %version.id, state = %self.state(), "skipping rebuild");
            return;
        }

        tracing::warn!(version = %version.id, "instance trapped, rebuilding");
        if let Err(e) = self
            .inner
            .state
            .transition(EngineState::Reloading(version.clone()))
        {
            tracing::warn!("rebuild not started: {e}");
            return;
        }
        if let Err(e) = self.activate_locked(version).await {
            tracing::error!("rebuild failed: {e}");
        }
    }

    // ── Options ──────────────────────────────────────────────────────

    pub fn set_option(&self, name: &str, value: Vec<u8>) {
        if let Ok(mut options) = self.inner.options.lock() {
            options.copts.insert(name.to_string(), value.clone());
        }
        if let Some(instance) = self.active_instance() {
            instance.set_option(name, value);
        }
    }

    pub fn remove_option(&self, name: &str) {
        if let Ok(mut options) = self.inner.options.lock() {
            options.copts.remove(name);
        }
        if let Some(instance) = self.active_instance() {
            instance.remove_option(name);
        }
    }

    pub fn set_premium(&self, premium: bool) {
        if let Ok(mut options) = self.inner.options.lock() {
            options.premium = premium;
        }
        if let Some(instance) = self.active_instance() {
            instance.set_premium(premium);
        }
    }
}

fn spawn_watcher(
    engine: Weak<EngineInner>,
    instance_id: Uuid,
    events: mpsc::UnboundedReceiver<InstanceEvent>,
) {
    tokio::spawn(watch_instance(engine, instance_id, events));
}

/// Follows one instance's events; rebuilds it after a trap.
async fn watch_instance(
    engine: Weak<EngineInner>,
    instance_id: Uuid,
    mut events: mpsc::UnboundedReceiver<InstanceEvent>,
) {
    while let Some(event) = events.recv().await {
        match event.state {
            InstanceState::Trapped => {
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                if !inner.config.rebuild_on_trap {
                    tracing::warn!(instance = %instance_id, reason = ?event.reason, "instance trapped");
                    continue;
                }
                Engine { inner }.rebuild(instance_id).await;
            }
            InstanceState::Stopped => return,
            InstanceState::Idle | InstanceState::Running => {}
        }
    }
}

// ─── Music calls ────────────────────────────────────────────────────────

#[async_trait]
impl MusicService for Engine {
    async fn details(&self, vid: &str) -> Result<TrackDetails> {
        self.client()?.details(vid).await
    }

    async fn transcript(&self, vid: &str) -> Result<Transcript> {
        self.client()?.transcript(vid).await
    }

    async fn search(
        &self,
        keyword: &str,
        scope: &str,
        continuation: Option<&str>,
    ) -> Result<ListTracks> {
        self.client()?.search(keyword, scope, continuation).await
    }

    async fn suggestion(&self, keyword: &str) -> Result<ListSuggestions> {
        self.client()?.suggestion(keyword).await
    }

    async fn tracks(&self, pid: &str, continuation: Option<&str>) -> Result<ListTracks> {
        self.client()?.tracks(pid, continuation).await
    }

    async fn options(&self) -> Result<ListOptions> {
        self.client()?.options().await
    }

    async fn discover(&self, category: &str, continuation: Option<&str>) -> Result<ListTracks> {
        self.client()?.discover(category, continuation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_keeps_engine_level_kinds() {
        assert!(matches!(
            duplicate(&EngineError::Cancelled),
            EngineError::Cancelled
        ));
        assert!(matches!(
            duplicate(&EngineError::Download("404".into())),
            EngineError::Download(m) if m == "404"
        ));
        let io = EngineError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(matches!(duplicate(&io), EngineError::Activation(m) if m.contains("gone")));
    }

    #[test]
    fn test_update_mode_default_is_automatic() {
        assert_eq!(UpdateMode::default(), UpdateMode::Automatic);
    }
}
