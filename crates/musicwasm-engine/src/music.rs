//! Typed music operations over the generic call primitive.
//!
//! Each operation builds a [`CallEnvelope`] for its call id, invokes the
//! instance and decodes the message type that call answers with. `details`
//! additionally retries until the module hands back a playable stream.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::call_id::MusicCallId;
use crate::codec::{self, CallEnvelope};
use crate::error::{EngineError, Result};
use crate::instance::Instance;
use crate::messages::{ListOptions, ListSuggestions, ListTracks, TrackDetails, Transcript};
use crate::probe::ReachabilityProbe;
use crate::retry::{sleep_or_cancel, RetryPolicy};

#[async_trait]
pub trait MusicService: Send + Sync {
    async fn details(&self, vid: &str) -> Result<TrackDetails>;

    async fn transcript(&self, vid: &str) -> Result<Transcript>;

    async fn search(
        &self,
        keyword: &str,
        scope: &str,
        continuation: Option<&str>,
    ) -> Result<ListTracks>;

    async fn suggestion(&self, keyword: &str) -> Result<ListSuggestions>;

    /// Items of a playlist.
    async fn tracks(&self, pid: &str, continuation: Option<&str>) -> Result<ListTracks>;

    async fn options(&self) -> Result<ListOptions>;

    async fn discover(&self, category: &str, continuation: Option<&str>) -> Result<ListTracks>;
}

/// [`MusicService`] bound to one instance.
#[derive(Clone)]
pub struct MusicClient {
    instance: Arc<Instance>,
    probe: Arc<dyn ReachabilityProbe>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl MusicClient {
    pub fn new(
        instance: Arc<Instance>,
        probe: Arc<dyn ReachabilityProbe>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            instance,
            probe,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the `details` retry loop when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn request<T: DeserializeOwned>(&self, envelope: CallEnvelope) -> Result<T> {
        let bytes = self.instance.call(envelope).await?;
        codec::decode(&bytes)
    }

    /// A details result is complete when its first stream answers.
    async fn is_complete(&self, details: &TrackDetails) -> bool {
        match details.formats.first() {
            Some(format) => self.probe.is_reachable(&format.url).await,
            None => false,
        }
    }
}

#[async_trait]
impl MusicService for MusicClient {
    async fn details(&self, vid: &str) -> Result<TrackDetails> {
        let start = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let envelope = CallEnvelope::new(MusicCallId::GetDetails).arg("url", vid);
            let details: TrackDetails = self.request(envelope).await?;

            if self.is_complete(&details).await {
                tracing::debug!(
                    vid,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "details resolved"
                );
                return Ok(details);
            }

            if attempt == max_attempts {
                break;
            }

            let wait = self.retry.backoff(attempt);
            tracing::debug!(
                vid,
                attempt,
                formats = details.formats.len(),
                wait_ms = wait.as_millis() as u64,
                "details incomplete, retrying"
            );
            sleep_or_cancel(wait, &self.cancel).await?;
        }

        tracing::warn!(vid, attempts = max_attempts, "details never became playable");
        Err(EngineError::MaximumRetryExceeded(max_attempts))
    }

    async fn transcript(&self, vid: &str) -> Result<Transcript> {
        self.request(CallEnvelope::new(MusicCallId::GetTranscript).arg("vid", vid))
            .await
    }

    async fn search(
        &self,
        keyword: &str,
        scope: &str,
        continuation: Option<&str>,
    ) -> Result<ListTracks> {
        let envelope = CallEnvelope::new(MusicCallId::Search)
            .arg("keyword", keyword)
            .arg("scope", scope)
            .optional_arg("continuation", continuation);
        self.request(envelope).await
    }

    async fn suggestion(&self, keyword: &str) -> Result<ListSuggestions> {
        self.request(CallEnvelope::new(MusicCallId::Suggestion).arg("keyword", keyword))
            .await
    }

    async fn tracks(&self, pid: &str, continuation: Option<&str>) -> Result<ListTracks> {
        let envelope = CallEnvelope::new(MusicCallId::GetPlaylistDetails)
            .arg("id", pid)
            .optional_arg("continuation", continuation);
        self.request(envelope).await
    }

    async fn options(&self) -> Result<ListOptions> {
        self.request(CallEnvelope::new(MusicCallId::GetOptions)).await
    }

    async fn discover(&self, category: &str, continuation: Option<&str>) -> Result<ListTracks> {
        let envelope = CallEnvelope::new(MusicCallId::GetDiscover)
            .arg("category", category)
            .optional_arg("continuation", continuation);
        self.request(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::call_id::{CallerId, EngineCallId};
    use crate::codec::Command;
    use crate::config::CallContext;
    use crate::messages::{MediaFormat, Track};
    use crate::sandbox::WasmModule;

    /// Answers details with empty formats for the first `empty_for` calls.
    struct CatalogModule {
        empty_for: usize,
        details_calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<CallEnvelope>>>,
    }

    #[async_trait]
    impl WasmModule for CatalogModule {
        async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>> {
            let command: Command = codec::decode(&input)?;
            let call = command.call;
            self.seen.lock().unwrap().push(call.clone());

            if call.id == EngineCallId::Initialize.to_call_id() {
                return codec::encode_message(&());
            }
            if call.id == MusicCallId::GetDetails.to_call_id() {
                let n = self.details_calls.fetch_add(1, Ordering::SeqCst);
                let mut details = TrackDetails {
                    id: call.args["url"].as_str().unwrap_or_default().to_string(),
                    title: "Ways".into(),
                    ..Default::default()
                };
                if n >= self.empty_for {
                    details.formats.push(MediaFormat {
                        id: "140".into(),
                        url: "https://cdn.example/140.m4a".into(),
                        mime: "audio/mp4".into(),
                        ..Default::default()
                    });
                }
                return codec::encode_message(&details);
            }
            if call.id == MusicCallId::Search.to_call_id() {
                return codec::encode_message(&ListTracks {
                    items: vec![Track {
                        id: "t1".into(),
                        kind: "music#playlist".into(),
                        ..Default::default()
                    }],
                    continuation: Some("next".into()),
                });
            }
            if call.id == MusicCallId::GetTranscript.to_call_id() {
                return codec::encode_message(&serde_json::json!({
                    "event": "error",
                    "code": 404,
                    "reason": "no transcript"
                }));
            }
            codec::encode_message(&ListTracks::default())
        }

        async fn release(&self) {}
    }

    struct FakeProbe {
        reachable_after: usize,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn is_reachable(&self, _url: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst) >= self.reachable_after
        }
    }

    struct Harness {
        client: MusicClient,
        details_calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<CallEnvelope>>>,
    }

    fn harness(empty_for: usize, reachable_after: usize) -> Harness {
        let details_calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let module = CatalogModule {
            empty_for,
            details_calls: details_calls.clone(),
            seen: seen.clone(),
        };
        let instance = Arc::new(Instance::new(
            Box::new(module),
            Path::new("/cache/1.wasm"),
            CallContext::default(),
        ));
        let probe = Arc::new(FakeProbe {
            reachable_after,
            probes: AtomicUsize::new(0),
        });
        Harness {
            client: MusicClient::new(instance, probe, RetryPolicy::default()),
            details_calls,
            seen,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_details_retries_until_formats_present() {
        for n in [0, 1, 4, 9] {
            let h = harness(n, 0);
            let details = h.client.details("abc").await.unwrap();
            assert_eq!(details.id, "abc");
            assert_eq!(details.formats.len(), 1);
            assert_eq!(h.details_calls.load(Ordering::SeqCst), n + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_details_gives_up_after_exactly_ten_attempts() {
        let h = harness(usize::MAX, 0);
        let err = h.client.details("abc").await.unwrap_err();
        assert!(matches!(err, EngineError::MaximumRetryExceeded(10)), "got {err:?}");
        assert_eq!(h.details_calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_details_retries_unreachable_stream() {
        let h = harness(0, 2);
        h.client.details("abc").await.unwrap();
        assert_eq!(h.details_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_details_cancelled_between_attempts() {
        let h = harness(usize::MAX, 0);
        let token = CancellationToken::new();
        token.cancel();
        let client = h.client.clone().with_cancel(token);

        let err = client.details("abc").await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(h.details_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_search_arguments_and_continuation_omission() {
        let h = harness(0, 0);
        let page = h.client.search("ways", "all", None).await.unwrap();
        assert!(page.items[0].is_playlist());
        assert_eq!(page.continuation.as_deref(), Some("next"));

        h.client.search("ways", "all", Some("next")).await.unwrap();

        let seen = h.seen.lock().unwrap();
        let searches: Vec<_> = seen
            .iter()
            .filter(|c| c.id == "MUSIC_CALL_ID_SEARCH")
            .collect();
        assert_eq!(searches.len(), 2);
        assert_eq!(searches[0].args.len(), 2);
        assert_eq!(searches[0].args["keyword"].as_str(), Some("ways"));
        assert_eq!(searches[0].args["scope"].as_str(), Some("all"));
        assert!(!searches[0].args.contains_key("continuation"));
        assert_eq!(searches[1].args["continuation"].as_str(), Some("next"));
    }

    #[tokio::test]
    async fn test_operation_call_ids_and_args() {
        let h = harness(0, 0);
        h.client.suggestion("wa").await.unwrap();
        h.client.tracks("PL1", Some("")).await.unwrap();
        h.client.options().await.unwrap();
        h.client.discover("mood", Some("c2")).await.unwrap();

        let seen = h.seen.lock().unwrap();
        let calls: Vec<(&str, Vec<&str>)> = seen
            .iter()
            .skip(1)
            .map(|c| (c.id.as_str(), c.args.keys().map(String::as_str).collect()))
            .collect();
        assert_eq!(
            calls,
            vec![
                ("MUSIC_CALL_ID_SUGGESTION", vec!["keyword"]),
                ("MUSIC_CALL_ID_GET_PLAYLIST_DETAILS", vec!["id"]),
                ("MUSIC_CALL_ID_GET_OPTIONS", vec![]),
                ("MUSIC_CALL_ID_GET_DISCOVER", vec!["category", "continuation"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_module_error_event_surfaces() {
        let h = harness(0, 0);
        let err = h.client.transcript("abc").await.unwrap_err();
        assert!(matches!(err, EngineError::Module { code: 404, .. }), "got {err:?}");
    }
}
