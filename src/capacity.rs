use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::completion::{ChatMessage, CompletionError, CompletionRequest, LmBackend};

/// Discovered usable capacity of the backend. Immutable once computed.
#[derive(Debug, Clone)]
pub struct CapacityProfile {
    pub model: String,
    pub context_tokens: usize,
    pub max_output_tokens: usize,
    pub probed_at: DateTime<Utc>,
}

impl CapacityProfile {
    /// Hard-coded fallback used when probing never succeeds; small enough
    /// to be safe on any model LM Studio will actually load.
    pub fn conservative_default(model: &str) -> Self {
        Self {
            model: model.to_string(),
            context_tokens: 3000,
            max_output_tokens: 512,
            probed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("no model loaded on the backend")]
    NoModelLoaded,
}

/// Approximate token sizes for the increasing probe sequence
const PROBE_LADDER: [usize; 8] = [500, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 100_000];

/// Working size -> (context_tokens, max_output_tokens). Multipliers stay
/// below unity to leave headroom for prompt scaffolding and the response.
const CAPACITY_STEPS: [(usize, usize, usize); 7] = [
    (100_000, 80_000, 8_192),
    (64_000, 48_000, 8_192),
    (32_000, 24_000, 4_096),
    (16_000, 12_000, 4_096),
    (8_000, 6_000, 2_048),
    (4_000, 3_000, 1_024),
    (2_000, 1_500, 512),
];

static NUMBER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d[\d,]*").unwrap());

/// Largest integer above 1000 embedded in an error payload, if any.
/// Backends tend to echo their real window in messages like
/// "this model's maximum context length is 8192 tokens".
fn extract_limit_hint(body: &str) -> Option<usize> {
    NUMBER_PATTERN
        .find_iter(body)
        .filter_map(|m| m.as_str().replace(',', "").parse::<usize>().ok())
        .filter(|&n| n > 1_000)
        .max()
}

/// Map the largest working probe size through the step table
fn profile_for_working_size(model: &str, working: usize) -> Option<CapacityProfile> {
    for &(min_working, context_tokens, max_output_tokens) in &CAPACITY_STEPS {
        if working >= min_working {
            return Some(CapacityProfile {
                model: model.to_string(),
                context_tokens,
                max_output_tokens,
                probed_at: Utc::now(),
            });
        }
    }
    None
}

/// Larger probes get longer to answer; a slow large round trip is not a failure
fn probe_timeout(approx_tokens: usize) -> Duration {
    Duration::from_secs(15 + (approx_tokens / 1_000) as u64)
}

/// Synthetic filler of roughly `approx_tokens` tokens (4 chars per token)
fn synthetic_payload(approx_tokens: usize) -> String {
    // 40 chars -> ~10 tokens per repetition
    const FILLER: &str = "ceci est un texte de calibration neutre ";
    FILLER.repeat((approx_tokens * 4 / FILLER.len()).max(1))
}

/// Discovers and memoizes the backend's usable capacity. The cache mutex is
/// held for the whole probe so concurrent first callers wait on one probe
/// instead of launching their own (single-flight).
pub struct CapacityProbe<B: LmBackend> {
    backend: Arc<B>,
    cached: Mutex<Option<CapacityProfile>>,
}

impl<B: LmBackend> CapacityProbe<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, cached: Mutex::new(None) }
    }

    /// Pre-seed the cache from a manual override; no probing will ever run
    pub fn with_override(
        backend: Arc<B>,
        model: &str,
        context_tokens: usize,
        max_output_tokens: usize,
    ) -> Self {
        info!(
            "📐 Capacity override active: context={} tokens, output={} tokens",
            context_tokens, max_output_tokens
        );
        Self {
            backend,
            cached: Mutex::new(Some(CapacityProfile {
                model: model.to_string(),
                context_tokens,
                max_output_tokens,
                probed_at: Utc::now(),
            })),
        }
    }

    /// Memoized capacity profile; probes the backend on first use only
    pub async fn profile(&self) -> Result<CapacityProfile, ProbeError> {
        let mut cached = self.cached.lock().await;
        if let Some(profile) = cached.as_ref() {
            return Ok(profile.clone());
        }

        let profile = self.probe_backend().await?;
        *cached = Some(profile.clone());
        Ok(profile)
    }

    /// Drop the memoized profile, e.g. after the operator swaps models
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn probe_backend(&self) -> Result<CapacityProfile, ProbeError> {
        let models = self
            .backend
            .list_models()
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        let model = models.into_iter().next().ok_or(ProbeError::NoModelLoaded)?;
        info!("🔎 Probing capacity of model '{}'", model);

        let mut largest_ok: usize = 0;

        for &size in &PROBE_LADDER {
            let request = CompletionRequest {
                model: model.clone(),
                messages: vec![
                    ChatMessage::system("Réponds uniquement: ok"),
                    ChatMessage::user(synthetic_payload(size)),
                ],
                max_tokens: 16,
                timeout: probe_timeout(size),
            };

            match self.backend.complete(request).await {
                Ok(_) => {
                    debug!("🔎 Probe at ~{} tokens succeeded", size);
                    largest_ok = size;
                }
                Err(err) => {
                    debug!("🔎 Probe at ~{} tokens failed: {}", size, err);
                    if let CompletionError::BadResponse { ref body, .. } = err {
                        if let Some(hint) = extract_limit_hint(body) {
                            // The server usually echoes its real window; keep
                            // 20% margin since the message may count tokens
                            // differently than we do.
                            largest_ok = hint * 4 / 5;
                            debug!("🔎 Error payload hints at a {}-token limit", hint);
                        }
                    }
                    break;
                }
            }
        }

        match profile_for_working_size(&model, largest_ok) {
            Some(profile) => {
                info!(
                    "📐 Capacity for '{}': context={} tokens, output={} tokens",
                    model, profile.context_tokens, profile.max_output_tokens
                );
                Ok(profile)
            }
            None => {
                warn!(
                    "⚠️ No probe size succeeded for '{}'; using conservative defaults",
                    model
                );
                Ok(CapacityProfile::conservative_default(&model))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LadderBackend {
        /// Probes at or below this approximate size succeed
        limit: usize,
        error_body: String,
        list_calls: AtomicUsize,
        complete_calls: AtomicUsize,
    }

    impl LadderBackend {
        fn new(limit: usize, error_body: &str) -> Self {
            Self {
                limit,
                error_body: error_body.to_string(),
                list_calls: AtomicUsize::new(0),
                complete_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LmBackend for LadderBackend {
        async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["qwen-test".to_string()])
        }

        async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            let approx_tokens = request
                .messages
                .iter()
                .map(|m| m.content.len() / 4)
                .sum::<usize>();
            if approx_tokens <= self.limit {
                Ok("ok".to_string())
            } else {
                Err(CompletionError::BadResponse {
                    status: 400,
                    body: self.error_body.clone(),
                })
            }
        }
    }

    #[test]
    fn test_extract_limit_hint_takes_largest_integer_above_1000() {
        let body = "Error 400: maximum context length is 8192 tokens, you requested 12451";
        assert_eq!(extract_limit_hint(body), Some(12_451));
        assert_eq!(extract_limit_hint("code 500, try again"), None);
        assert_eq!(extract_limit_hint("limit is 32,768 tokens"), Some(32_768));
    }

    #[test]
    fn test_step_table_is_conservative() {
        let profile = profile_for_working_size("m", 16_000).unwrap();
        assert!(profile.context_tokens < 16_000);
        assert_eq!(profile.context_tokens, 12_000);
        assert_eq!(profile.max_output_tokens, 4_096);

        assert!(profile_for_working_size("m", 1_500).is_none());
        assert_eq!(profile_for_working_size("m", 150_000).unwrap().context_tokens, 80_000);
    }

    #[test]
    fn test_probe_timeout_scales_with_size() {
        assert!(probe_timeout(100_000) > probe_timeout(500));
    }

    #[tokio::test]
    async fn test_probe_stops_at_first_failure_and_maps_working_size() {
        let backend = Arc::new(LadderBackend::new(9_000, "context overflow"));
        let probe = CapacityProbe::new(backend.clone());
        let profile = probe.profile().await.unwrap();
        // 8000 succeeds, 16000 fails without a usable hint
        assert_eq!(profile.context_tokens, 6_000);
        assert_eq!(profile.max_output_tokens, 2_048);
        assert_eq!(profile.model, "qwen-test");
        // 500..8000 succeed (4 calls) then 16000 fails (1 call)
        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_error_hint_overrides_working_size() {
        // 8000 ok, 16000 fails naming a 12800-token limit: 80% of 12800 =
        // 10240, which stays on the same step row as the bare 8000 success
        let backend = Arc::new(LadderBackend::new(9_000, "maximum context length is 12800 tokens"));
        let probe = CapacityProbe::new(backend);
        let profile = probe.profile().await.unwrap();
        assert_eq!(profile.context_tokens, 6_000);

        // A bigger hint crosses into the 16000 row
        let backend = Arc::new(LadderBackend::new(9_000, "maximum context length is 24000 tokens"));
        let probe = CapacityProbe::new(backend);
        let profile = probe.profile().await.unwrap();
        assert_eq!(profile.context_tokens, 12_000);

        // A hint below everything that succeeded caps the fluke successes
        let backend = Arc::new(LadderBackend::new(9_000, "maximum context length is 2500 tokens"));
        let probe = CapacityProbe::new(backend);
        let profile = probe.profile().await.unwrap();
        assert_eq!(profile.context_tokens, 1_500);
    }

    #[tokio::test]
    async fn test_profile_is_memoized() {
        let backend = Arc::new(LadderBackend::new(3_000, "overflow"));
        let probe = CapacityProbe::new(backend.clone());

        let first = probe.profile().await.unwrap();
        let calls_after_first = backend.complete_calls.load(Ordering::SeqCst);
        let second = probe.profile().await.unwrap();

        assert_eq!(first.context_tokens, second.context_tokens);
        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_a_fresh_probe() {
        let backend = Arc::new(LadderBackend::new(3_000, "overflow"));
        let probe = CapacityProbe::new(backend.clone());

        probe.profile().await.unwrap();
        probe.invalidate().await;
        probe.profile().await.unwrap();

        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_override_skips_probing_entirely() {
        let backend = Arc::new(LadderBackend::new(3_000, "overflow"));
        let probe = CapacityProbe::with_override(backend.clone(), "pinned", 16_000, 4_096);
        let profile = probe.profile().await.unwrap();
        assert_eq!(profile.context_tokens, 16_000);
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_model_loaded() {
        struct EmptyBackend;
        #[async_trait::async_trait]
        impl LmBackend for EmptyBackend {
            async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
                Ok(vec![])
            }
            async fn complete(&self, _r: CompletionRequest) -> Result<String, CompletionError> {
                unreachable!("probe must not send completions without a model")
            }
        }
        let probe = CapacityProbe::new(Arc::new(EmptyBackend));
        assert!(matches!(probe.profile().await, Err(ProbeError::NoModelLoaded)));
    }
}
