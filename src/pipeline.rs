use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{error, info, warn};

use crate::capacity::{CapacityProbe, CapacityProfile};
use crate::completion::{ChatMessage, CompletionError, CompletionRequest, LmBackend};
use crate::config::LMConfig;
use crate::prompts::PromptSet;
use crate::queue::{JobRunner, SummarizationJob};
use crate::segment::{split_text, Segment};

/// Hard ceiling on segment size even when the context window allows more;
/// past this point summary quality drops faster than the call count.
const MAX_SEGMENT_CHARS: usize = 12_000;
/// Above this many segments, an intermediate fusion round runs first
const DIRECT_FUSION_MAX_SEGMENTS: usize = 15;
/// Reduction keeps running until this few summaries remain
const FINAL_FUSION_MAX_SUMMARIES: usize = 5;
/// Per-segment summaries don't need the model's full output budget
const SEGMENT_SUMMARY_MAX_TOKENS: usize = 500;
const FUSION_MAX_TOKENS: usize = 1_000;

/// Transcripts larger than this never help a single-question answer
const MAX_QUESTION_CONTEXT_CHARS: usize = 48_000;

pub const APOLOGY: &str = "Désolé, je n'ai pas pu produire de résumé pour cette vidéo.";
pub const ANSWER_APOLOGY: &str = "Désolé, je n'ai pas pu répondre à cette question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStatus {
    Ok,
    Degraded,
    Failed,
}

/// Summary of a contiguous run of segments (1-based, inclusive)
#[derive(Debug, Clone)]
pub struct PartialSummary {
    pub first_segment: usize,
    pub last_segment: usize,
    pub text: String,
    pub status: SummaryStatus,
}

/// Largest prefix of `text` not exceeding half its bytes, cut on a char boundary
fn first_half(text: &str) -> &str {
    let mut mid = text.len() / 2;
    while mid > 0 && !text.is_char_boundary(mid) {
        mid -= 1;
    }
    &text[..mid]
}

/// Map-reduce summarizer over an LM Studio-compatible backend.
/// `summarize` always returns usable text, degrading through simplified
/// retries, placeholders, and a labeled concatenation before giving up
/// with an apology.
pub struct Summarizer<B: LmBackend> {
    backend: Arc<B>,
    probe: Arc<CapacityProbe<B>>,
    prompts: PromptSet,
    fallback_model: String,
    request_timeout: Duration,
}

impl<B: LmBackend> Summarizer<B> {
    pub fn new(
        backend: Arc<B>,
        probe: Arc<CapacityProbe<B>>,
        prompts: PromptSet,
        config: &LMConfig,
    ) -> Self {
        Self {
            backend,
            probe,
            prompts,
            fallback_model: config.default_model.clone(),
            request_timeout: Duration::from_secs(config.timeout),
        }
    }

    pub async fn summarize(&self, raw_text: &str) -> String {
        if raw_text.trim().is_empty() {
            return APOLOGY.to_string();
        }

        let profile = match self.probe.profile().await {
            Ok(profile) => profile,
            Err(err) => {
                warn!("⚠️ Capacity probe failed ({}), using conservative defaults", err);
                CapacityProfile::conservative_default(&self.fallback_model)
            }
        };

        let target = MAX_SEGMENT_CHARS.min(profile.context_tokens * 3);
        let segments = split_text(raw_text, target, profile.context_tokens);
        info!(
            "📝 Summarizing {} chars as {} segment(s) with '{}'",
            raw_text.len(),
            segments.len(),
            profile.model
        );

        let mut summaries = self.summarize_segments(&segments, &profile).await;

        // Reduce until everything fits in a single final request
        let mut first_round = true;
        while summaries.len() > FINAL_FUSION_MAX_SUMMARIES {
            let batch_size = if first_round && segments.len() > DIRECT_FUSION_MAX_SEGMENTS {
                (summaries.len() / 5).clamp(3, 6)
            } else {
                3
            };
            first_round = false;
            summaries = self.fuse_round(summaries, batch_size, &profile).await;
        }

        self.final_fusion(summaries, &profile).await
    }

    async fn complete_once(
        &self,
        model: &str,
        prompt: &str,
        text: &str,
        max_tokens: i32,
    ) -> Result<String, CompletionError> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::system(prompt), ChatMessage::user(text)],
            max_tokens,
            timeout: self.request_timeout,
        };
        self.backend.complete(request).await
    }

    /// Stage 1: one summary per segment, in order. Failures retry once with
    /// the simplified prompt on half the text, then yield a placeholder.
    async fn summarize_segments(
        &self,
        segments: &[Segment],
        profile: &CapacityProfile,
    ) -> Vec<PartialSummary> {
        let max_tokens = profile.max_output_tokens.min(SEGMENT_SUMMARY_MAX_TOKENS) as i32;
        let mut summaries = Vec::with_capacity(segments.len());

        for segment in segments {
            let number = segment.index + 1;
            let summary = match self
                .complete_once(&profile.model, &self.prompts.segment, &segment.text, max_tokens)
                .await
            {
                Ok(text) => PartialSummary {
                    first_segment: number,
                    last_segment: number,
                    text,
                    status: SummaryStatus::Ok,
                },
                Err(err) => {
                    warn!("⚠️ Segment {} failed ({}), retrying simplified", number, err);
                    match self
                        .complete_once(
                            &profile.model,
                            &self.prompts.segment_simple,
                            first_half(&segment.text),
                            max_tokens,
                        )
                        .await
                    {
                        Ok(text) => PartialSummary {
                            first_segment: number,
                            last_segment: number,
                            text,
                            status: SummaryStatus::Degraded,
                        },
                        Err(err) => {
                            error!("❌ Segment {} unrecoverable: {}", number, err);
                            PartialSummary {
                                first_segment: number,
                                last_segment: number,
                                text: format!("[segment {} unavailable]", number),
                                status: SummaryStatus::Failed,
                            }
                        }
                    }
                }
            };
            summaries.push(summary);
        }

        summaries
    }

    /// Stage 2: fuse consecutive summaries in batches, concurrently.
    /// `join_all` preserves batch order in the output.
    async fn fuse_round(
        &self,
        summaries: Vec<PartialSummary>,
        batch_size: usize,
        profile: &CapacityProfile,
    ) -> Vec<PartialSummary> {
        info!("🔗 Fusing {} summaries in batches of {}", summaries.len(), batch_size);
        let batches: Vec<&[PartialSummary]> = summaries.chunks(batch_size).collect();
        let futures: Vec<_> = batches
            .iter()
            .map(|batch| self.fuse_batch(batch, profile))
            .collect();
        join_all(futures).await
    }

    async fn fuse_batch(
        &self,
        batch: &[PartialSummary],
        profile: &CapacityProfile,
    ) -> PartialSummary {
        let first = batch[0].first_segment;
        let last = batch[batch.len() - 1].last_segment;
        let joined: String = batch
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let degraded = batch.iter().any(|s| s.status != SummaryStatus::Ok);
        let max_tokens = profile.max_output_tokens.min(FUSION_MAX_TOKENS) as i32;

        match self
            .complete_once(&profile.model, &self.prompts.fusion, &joined, max_tokens)
            .await
        {
            Ok(text) => PartialSummary {
                first_segment: first,
                last_segment: last,
                text,
                status: if degraded { SummaryStatus::Degraded } else { SummaryStatus::Ok },
            },
            Err(err) => {
                warn!("⚠️ Fusion of segments {}-{} failed ({}), retrying halved", first, last, err);
                match self
                    .complete_once(&profile.model, &self.prompts.fusion, first_half(&joined), max_tokens)
                    .await
                {
                    Ok(text) => PartialSummary {
                        first_segment: first,
                        last_segment: last,
                        text,
                        status: SummaryStatus::Degraded,
                    },
                    Err(err) => {
                        error!("❌ Fusion of segments {}-{} unrecoverable: {}", first, last, err);
                        PartialSummary {
                            first_segment: first,
                            last_segment: last,
                            text: format!("[segments {}-{} unavailable]", first, last),
                            status: SummaryStatus::Failed,
                        }
                    }
                }
            }
        }
    }

    /// Stage 3: one final fusion pass, falling back to a labeled
    /// concatenation when the backend won't cooperate.
    async fn final_fusion(
        &self,
        summaries: Vec<PartialSummary>,
        profile: &CapacityProfile,
    ) -> String {
        if summaries.is_empty() {
            return APOLOGY.to_string();
        }
        if summaries.len() == 1 {
            let only = &summaries[0];
            if only.text.trim().is_empty() {
                return APOLOGY.to_string();
            }
            return only.text.clone();
        }

        let joined: String = summaries
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        match self
            .complete_once(
                &profile.model,
                &self.prompts.final_fusion,
                &joined,
                profile.max_output_tokens as i32,
            )
            .await
        {
            // A custom backend may hand back blank text as a success; the
            // non-empty postcondition belongs here, not in the client.
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("⚠️ Final fusion returned empty text, returning labeled parts");
                assemble_fallback(&summaries)
            }
            Err(err) => {
                warn!("⚠️ Final fusion failed ({}), returning labeled parts", err);
                assemble_fallback(&summaries)
            }
        }
    }

    /// Single-shot question answering over a transcript: trim the
    /// transcript to the context budget, keep the question intact, ask once.
    pub async fn answer(&self, transcript: &str, question: &str) -> String {
        if transcript.trim().is_empty() || question.trim().is_empty() {
            return ANSWER_APOLOGY.to_string();
        }

        let profile = match self.probe.profile().await {
            Ok(profile) => profile,
            Err(err) => {
                warn!("⚠️ Capacity probe failed ({}), using conservative defaults", err);
                CapacityProfile::conservative_default(&self.fallback_model)
            }
        };

        let budget = MAX_QUESTION_CONTEXT_CHARS.min(profile.context_tokens * 3);
        let transcript = if transcript.len() > budget {
            let mut end = budget;
            while !transcript.is_char_boundary(end) {
                end -= 1;
            }
            warn!("⚠️ Transcript truncated to {} chars for the question", end);
            &transcript[..end]
        } else {
            transcript
        };

        let user_text = format!(
            "Voici la transcription d'une vidéo YouTube :\n\n{}\n\nRéponds à la question suivante de manière claire et utile : {}",
            transcript, question
        );

        match self
            .complete_once(
                &profile.model,
                &self.prompts.question,
                &user_text,
                profile.max_output_tokens as i32,
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => ANSWER_APOLOGY.to_string(),
            Err(err) => {
                error!("❌ Question answering failed: {}", err);
                ANSWER_APOLOGY.to_string()
            }
        }
    }
}

/// Readable assembly of whatever survived, one labeled part per summary
fn assemble_fallback(summaries: &[PartialSummary]) -> String {
    let parts: Vec<String> = summaries
        .iter()
        .map(|s| {
            if s.first_segment == s.last_segment {
                format!("Partie {} : {}", s.first_segment, s.text)
            } else {
                format!("Parties {}-{} : {}", s.first_segment, s.last_segment, s.text)
            }
        })
        .collect();

    let text = parts.join("\n\n");
    if text.trim().is_empty() {
        APOLOGY.to_string()
    } else {
        text
    }
}

#[async_trait]
impl<B: LmBackend> JobRunner for Summarizer<B> {
    async fn run(&self, job: &SummarizationJob) -> String {
        self.summarize(&job.raw_text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_config() -> LMConfig {
        LMConfig {
            base_url: "http://127.0.0.1:1234".to_string(),
            timeout: 30,
            default_model: "test-model".to_string(),
            default_temperature: 0.7,
            default_max_tokens: 2048,
            context_tokens_override: None,
            max_output_tokens_override: None,
            delivery_max_retries: 3,
            delivery_backoff_ms: 1,
            tts_command: None,
            subscriptions_file: "subscriptions.json".to_string(),
            watch_interval_secs: 900,
        }
    }

    /// Scripted backend: segment payloads (raw 'x' filler) get numbered
    /// replies, fusion payloads get an echo of their first part, so batch
    /// composition and ordering stay visible in the output.
    struct ScriptedBackend {
        fail_rich_prompt: Option<String>,
        fail_all: bool,
        blank_fusions: bool,
        complete_calls: AtomicUsize,
        recorded: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn succeeding() -> Self {
            Self {
                fail_rich_prompt: None,
                fail_all: false,
                blank_fusions: false,
                complete_calls: AtomicUsize::new(0),
                recorded: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self { fail_all: true, ..Self::succeeding() }
        }

        fn failing_prompt(prompt: &str) -> Self {
            Self { fail_rich_prompt: Some(prompt.to_string()), ..Self::succeeding() }
        }

        fn blank_fusions() -> Self {
            Self { blank_fusions: true, ..Self::succeeding() }
        }
    }

    #[async_trait]
    impl LmBackend for ScriptedBackend {
        async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
            Ok(vec!["test-model".to_string()])
        }

        async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
            let n = self.complete_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let system = request.messages[0].content.clone();
            let user = request.messages[1].content.clone();
            self.recorded.lock().unwrap().push(user.clone());

            if self.fail_all || self.fail_rich_prompt.as_deref() == Some(system.as_str()) {
                return Err(CompletionError::BadResponse {
                    status: 500,
                    body: "internal error".to_string(),
                });
            }

            if user.starts_with('x') {
                Ok(format!("R{}", n))
            } else if self.blank_fusions {
                Ok("   ".to_string())
            } else {
                let head = user.split("\n\n").next().unwrap_or("");
                Ok(format!("F({})", head))
            }
        }
    }

    fn summarizer(backend: Arc<ScriptedBackend>) -> Summarizer<ScriptedBackend> {
        let probe = Arc::new(CapacityProbe::with_override(
            backend.clone(),
            "test-model",
            100_000,
            2_048,
        ));
        Summarizer::new(backend, probe, PromptSet::default(), &test_config())
    }

    #[test]
    fn test_first_half_respects_char_boundaries() {
        let text = "ééé"; // 6 bytes, midpoint 3 is mid-char
        assert_eq!(first_half(text), "é");
        assert_eq!(first_half("abcd"), "ab");
    }

    #[tokio::test]
    async fn test_empty_input_yields_apology_without_calls() {
        let backend = Arc::new(ScriptedBackend::succeeding());
        let result = summarizer(backend.clone()).summarize("   ").await;
        assert_eq!(result, APOLOGY);
        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_segment_is_returned_directly() {
        let backend = Arc::new(ScriptedBackend::succeeding());
        let result = summarizer(backend.clone()).summarize(&"x".repeat(500)).await;
        assert_eq!(result, "R1");
        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_twenty_segments_fuse_in_ordered_contiguous_batches() {
        // 240k chars of filler hard-cut at 12k -> exactly 20 segments.
        // 20 > 15 so the first round uses batches of clamp(20/5, 3, 6) = 4,
        // leaving 5 summaries for the final pass: 20 + 5 + 1 = 26 calls.
        let backend = Arc::new(ScriptedBackend::succeeding());
        let result = summarizer(backend.clone()).summarize(&"x".repeat(240_000)).await;

        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 26);

        let recorded = backend.recorded.lock().unwrap();
        // Stage 1 runs sequentially, one segment per call
        for (i, payload) in recorded[..20].iter().enumerate() {
            assert!(payload.starts_with('x'), "call {} is not a segment", i);
        }
        // Each fusion batch holds four consecutive summaries in order
        for payload in &recorded[20..25] {
            let parts: Vec<&str> = payload.split("\n\n").collect();
            assert_eq!(parts.len(), 4);
            let numbers: Vec<usize> = parts
                .iter()
                .map(|p| p[1..].parse().unwrap())
                .collect();
            assert_eq!(numbers[0] % 4, 1, "batch does not start on a boundary");
            assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1));
        }
        // The final payload keeps the batches in original order
        assert_eq!(
            recorded[25],
            "F(R1)\n\nF(R5)\n\nF(R9)\n\nF(R13)\n\nF(R17)"
        );
        assert_eq!(result, "F(F(R1))");
    }

    #[tokio::test]
    async fn test_total_failure_still_yields_text_with_markers() {
        let backend = Arc::new(ScriptedBackend::failing());
        let result = summarizer(backend.clone()).summarize(&"x".repeat(25_000)).await;

        assert!(!result.trim().is_empty());
        assert!(result.contains("unavailable"), "missing placeholder: {}", result);
        assert!(result.contains("Partie 1"));
    }

    #[tokio::test]
    async fn test_single_segment_total_failure_keeps_placeholder() {
        let backend = Arc::new(ScriptedBackend::failing());
        let result = summarizer(backend).summarize("xxx").await;
        assert_eq!(result, "[segment 1 unavailable]");
    }

    #[tokio::test]
    async fn test_blank_final_fusion_falls_back_to_labeled_parts() {
        // The backend answers the final fusion with whitespace-only text;
        // the result must still carry the ordered per-segment summaries
        let backend = Arc::new(ScriptedBackend::blank_fusions());
        let result = summarizer(backend.clone()).summarize(&"x".repeat(25_000)).await;
        assert_eq!(result, "Partie 1 : R1\n\nPartie 2 : R2\n\nPartie 3 : R3");
    }

    #[tokio::test]
    async fn test_answer_asks_once_with_transcript_and_question() {
        let backend = Arc::new(ScriptedBackend::succeeding());
        let result = summarizer(backend.clone())
            .answer(&"y".repeat(500), "De quoi parle la vidéo ?")
            .await;

        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 1);
        let recorded = backend.recorded.lock().unwrap();
        assert!(recorded[0].starts_with("Voici la transcription"));
        assert!(recorded[0].ends_with("De quoi parle la vidéo ?"));
        assert_eq!(result, "F(Voici la transcription d'une vidéo YouTube :)");
    }

    #[tokio::test]
    async fn test_answer_truncates_oversized_transcripts() {
        // 1000-token context -> 3000-char transcript budget
        let backend = Arc::new(ScriptedBackend::succeeding());
        let probe = Arc::new(CapacityProbe::with_override(
            backend.clone(),
            "test-model",
            1_000,
            512,
        ));
        let summarizer =
            Summarizer::new(backend.clone(), probe, PromptSet::default(), &test_config());
        summarizer.answer(&"y".repeat(10_000), "Quel est le sujet ?").await;

        let recorded = backend.recorded.lock().unwrap();
        assert!(recorded[0].len() < 3_200, "not truncated: {} bytes", recorded[0].len());
        assert!(recorded[0].ends_with("Quel est le sujet ?"));
    }

    #[tokio::test]
    async fn test_answer_failure_and_blank_question_yield_apology() {
        let backend = Arc::new(ScriptedBackend::failing());
        let result = summarizer(backend).answer("une transcription", "pourquoi ?").await;
        assert_eq!(result, ANSWER_APOLOGY);

        let backend = Arc::new(ScriptedBackend::succeeding());
        let result = summarizer(backend.clone()).answer("une transcription", "   ").await;
        assert_eq!(result, ANSWER_APOLOGY);
        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_segment_retry_uses_simplified_prompt_on_half_the_text() {
        let prompts = PromptSet::default();
        let backend = Arc::new(ScriptedBackend::failing_prompt(&prompts.segment));
        let result = summarizer(backend.clone()).summarize(&"x".repeat(1_000)).await;

        assert_eq!(backend.complete_calls.load(Ordering::SeqCst), 2);
        assert_eq!(result, "R2");
        let recorded = backend.recorded.lock().unwrap();
        assert_eq!(recorded[1].len(), recorded[0].len() / 2);
    }
}
