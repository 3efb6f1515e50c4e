//! The per-participant pipeline engine.

use crate::capability::{Capabilities, Transcript};
use crate::error::{ParlanceError, Result};
use crate::pipeline::{OutputKind, StageConfig, StageOutput, UtteranceRouter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A finished utterance queued for final processing.
struct FinalJob {
    generation: u64,
    pcm: Vec<f32>,
    duration_ms: u32,
}

/// Per-participant pipeline handle.
///
/// Finals are serialized through a bounded queue consumed by one worker
/// task, which guarantees utterance-ordered delivery. Partials run as
/// detached tasks, bounded to one in flight.
pub struct StagePipeline {
    caps: Arc<Capabilities>,
    config: StageConfig,
    router: Arc<dyn UtteranceRouter>,
    /// Forced source language, `None` for auto-detection.
    language_hint: Option<String>,
    /// The active utterance generation (`active_utterance_id`).
    generation: Arc<AtomicU64>,
    partial_inflight: Arc<AtomicBool>,
    final_tx: mpsc::Sender<FinalJob>,
    worker: JoinHandle<()>,
}

impl StagePipeline {
    pub fn new(
        caps: Arc<Capabilities>,
        config: StageConfig,
        router: Arc<dyn UtteranceRouter>,
        language_hint: Option<String>,
    ) -> Self {
        let (final_tx, final_rx) = mpsc::channel(config.final_queue.max(1));
        let worker = tokio::spawn(final_worker(
            caps.clone(),
            config.clone(),
            router.clone(),
            language_hint.clone(),
            final_rx,
        ));
        Self {
            caps,
            config,
            router,
            language_hint,
            generation: Arc::new(AtomicU64::new(0)),
            partial_inflight: Arc::new(AtomicBool::new(false)),
            final_tx,
            worker,
        }
    }

    /// Current utterance generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// True when no interim transcription is in flight.
    pub fn partial_idle(&self) -> bool {
        !self.partial_inflight.load(Ordering::SeqCst)
    }

    /// Samples of utterance PCM required before a partial is attempted.
    pub fn partial_min_samples(&self) -> usize {
        (self.config.sample_rate as u64 * self.config.partial_min_ms as u64 / 1000) as usize
    }

    /// Launches an interim transcription over a snapshot of the current
    /// utterance PCM, unless one is already running or the snapshot is too
    /// short. A stale result (the utterance ended meanwhile) is dropped on
    /// arrival.
    pub fn maybe_submit_partial(&self, pcm: Vec<f32>) {
        if pcm.len() < self.partial_min_samples() {
            return;
        }
        if self.partial_inflight.swap(true, Ordering::SeqCst) {
            // One partial at a time; skip, don't queue.
            return;
        }

        let caps = self.caps.clone();
        let config = self.config.clone();
        let router = self.router.clone();
        let hint = self.language_hint.clone();
        let generation = self.generation.clone();
        let inflight = self.partial_inflight.clone();
        let tagged = generation.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let result = run_asr(&caps, pcm, hint.clone(), config.asr_timeout).await;
            inflight.store(false, Ordering::SeqCst);

            let transcript = match result {
                Ok(t) => t,
                Err(e) => {
                    debug!("partial transcription failed: {}", e);
                    return;
                }
            };
            if transcript.text.is_empty() {
                return;
            }
            if generation.load(Ordering::SeqCst) != tagged {
                return;
            }

            let language = transcript
                .language
                .or(hint)
                .unwrap_or_else(|| "unknown".to_string());

            let (translation, target_language) = if config.partial_translation {
                partial_translation(&caps, &config, router.as_ref(), &transcript.text, &language)
                    .await
            } else {
                (None, None)
            };

            // The utterance may have ended while MT ran.
            if generation.load(Ordering::SeqCst) != tagged {
                return;
            }

            router.deliver(StageOutput {
                generation: tagged,
                kind: OutputKind::Partial,
                text: transcript.text,
                language,
                translation,
                target_language,
                duration_ms: 0,
                tts_wav: None,
            });
        });
    }

    /// Queues the frozen utterance for final processing and advances the
    /// generation so any in-flight partial for it is dropped on arrival.
    pub fn submit_final(&self, pcm: Vec<f32>, duration_ms: u32) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        if pcm.is_empty() {
            return;
        }
        let job = FinalJob {
            generation,
            pcm,
            duration_ms,
        };
        if self.final_tx.try_send(job).is_err() {
            warn!(generation, "final queue saturated, dropping utterance");
        }
    }

    /// Cancels the final worker. Called when the connection closes.
    pub fn abort(&self) {
        self.worker.abort();
    }
}

impl Drop for StagePipeline {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn final_worker(
    caps: Arc<Capabilities>,
    config: StageConfig,
    router: Arc<dyn UtteranceRouter>,
    language_hint: Option<String>,
    mut rx: mpsc::Receiver<FinalJob>,
) {
    while let Some(job) = rx.recv().await {
        let generation = job.generation;
        match process_final(&caps, &config, router.as_ref(), language_hint.as_deref(), job).await
        {
            Ok(Some(output)) => router.deliver(output),
            Ok(None) => {}
            Err(e) => warn!(generation, "utterance dropped: {}", e),
        }
    }
}

/// Runs ASR, then MT and TTS when a target language applies, for one
/// finished utterance. Any stage error or timeout discards the utterance;
/// the session continues.
async fn process_final(
    caps: &Arc<Capabilities>,
    config: &StageConfig,
    router: &dyn UtteranceRouter,
    language_hint: Option<&str>,
    job: FinalJob,
) -> Result<Option<StageOutput>> {
    let transcript = run_asr(
        caps,
        job.pcm,
        language_hint.map(str::to_string),
        config.asr_timeout,
    )
    .await?;
    if transcript.text.is_empty() {
        return Ok(None);
    }

    let language = transcript
        .language
        .or_else(|| language_hint.map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    let mut translation = None;
    let mut target_language = None;
    let mut tts_wav = None;

    if let Some(target) = router.target_language(&language) {
        if target != language && language != "unknown" {
            let translated = run_mt(
                caps,
                &transcript.text,
                &language,
                &target,
                config.mt_timeout,
            )
            .await?;
            if !translated.is_empty() {
                if router.wants_tts() {
                    let wav = run_tts(caps, &translated, &target, config.tts_timeout).await?;
                    if !wav.is_empty() {
                        tts_wav = Some(wav);
                    }
                }
                translation = Some(translated);
                target_language = Some(target);
            }
        }
    }

    Ok(Some(StageOutput {
        generation: job.generation,
        kind: OutputKind::Final,
        text: transcript.text,
        language,
        translation,
        target_language,
        duration_ms: job.duration_ms,
        tts_wav,
    }))
}

async fn partial_translation(
    caps: &Arc<Capabilities>,
    config: &StageConfig,
    router: &dyn UtteranceRouter,
    text: &str,
    language: &str,
) -> (Option<String>, Option<String>) {
    let Some(target) = router.target_language(language) else {
        return (None, None);
    };
    if target == language || language == "unknown" {
        return (None, None);
    }
    match run_mt(caps, text, language, &target, config.mt_timeout).await {
        Ok(translated) if !translated.is_empty() => (Some(translated), Some(target)),
        Ok(_) => (None, None),
        Err(e) => {
            debug!("partial translation failed: {}", e);
            (None, None)
        }
    }
}

/// Runs a transcription on the blocking pool under a worker permit.
async fn run_asr(
    caps: &Arc<Capabilities>,
    pcm: Vec<f32>,
    language: Option<String>,
    budget: Duration,
) -> Result<Transcript> {
    let permit = caps
        .workers
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ParlanceError::Transcription {
            message: "worker pool closed".to_string(),
        })?;
    let asr = caps.asr.clone();
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        asr.transcribe(&pcm, language.as_deref())
    });
    match tokio::time::timeout(budget, task).await {
        Err(_) => Err(ParlanceError::CapabilityTimeout {
            stage: "asr",
            budget_ms: budget.as_millis() as u64,
        }),
        Ok(Err(e)) => Err(ParlanceError::Transcription {
            message: format!("transcription task panicked: {}", e),
        }),
        Ok(Ok(result)) => result,
    }
}

async fn run_mt(
    caps: &Arc<Capabilities>,
    text: &str,
    source: &str,
    target: &str,
    budget: Duration,
) -> Result<String> {
    let permit = caps
        .workers
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ParlanceError::Translation {
            message: "worker pool closed".to_string(),
        })?;
    let mt = caps.mt.clone();
    let (text, source, target) = (text.to_string(), source.to_string(), target.to_string());
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        mt.translate(&text, &source, &target)
    });
    match tokio::time::timeout(budget, task).await {
        Err(_) => Err(ParlanceError::CapabilityTimeout {
            stage: "mt",
            budget_ms: budget.as_millis() as u64,
        }),
        Ok(Err(e)) => Err(ParlanceError::Translation {
            message: format!("translation task panicked: {}", e),
        }),
        Ok(Ok(result)) => result,
    }
}

async fn run_tts(
    caps: &Arc<Capabilities>,
    text: &str,
    language: &str,
    budget: Duration,
) -> Result<Vec<u8>> {
    let permit = caps
        .workers
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ParlanceError::Synthesis {
            message: "worker pool closed".to_string(),
        })?;
    let tts = caps.tts.clone();
    let (text, language) = (text.to_string(), language.to_string());
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        tts.synthesize(&text, &language)
    });
    match tokio::time::timeout(budget, task).await {
        Err(_) => Err(ParlanceError::CapabilityTimeout {
            stage: "tts",
            budget_ms: budget.as_millis() as u64,
        }),
        Ok(Err(e)) => Err(ParlanceError::Synthesis {
            message: format!("synthesis task panicked: {}", e),
        }),
        Ok(Ok(result)) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::vad::GateBackend;
    use crate::capability::{
        MockSynthesizer, MockTranscriber, MockTranslator, Synthesizer, Transcriber, Translator,
    };

    fn caps_with(
        asr: impl Transcriber + 'static,
        mt: impl Translator + 'static,
        tts: impl Synthesizer + 'static,
    ) -> Arc<Capabilities> {
        Arc::new(Capabilities::new(
            Arc::new(asr),
            Arc::new(mt),
            Arc::new(tts),
            GateBackend::Energy { threshold: 0.02 },
            2,
        ))
    }

    struct CollectRouter {
        tx: mpsc::UnboundedSender<StageOutput>,
        target: Option<String>,
        tts: bool,
    }

    impl UtteranceRouter for CollectRouter {
        fn target_language(&self, _source: &str) -> Option<String> {
            self.target.clone()
        }

        fn wants_tts(&self) -> bool {
            self.tts
        }

        fn deliver(&self, output: StageOutput) {
            let _ = self.tx.send(output);
        }
    }

    fn router(
        target: Option<&str>,
        tts: bool,
    ) -> (Arc<CollectRouter>, mpsc::UnboundedReceiver<StageOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(CollectRouter {
                tx,
                target: target.map(str::to_string),
                tts,
            }),
            rx,
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<StageOutput>) -> StageOutput {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("channel closed")
    }

    fn one_second_pcm() -> Vec<f32> {
        vec![0.1f32; 16_000]
    }

    #[tokio::test]
    async fn test_final_runs_full_chain() {
        let caps = caps_with(
            MockTranscriber::new("m").with_response("hello").with_language("en"),
            MockTranslator::new().with_response("hola"),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(Some("es"), true);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        pipeline.submit_final(one_second_pcm(), 1200);

        let out = recv(&mut rx).await;
        assert_eq!(out.kind, OutputKind::Final);
        assert_eq!(out.generation, 0);
        assert_eq!(out.text, "hello");
        assert_eq!(out.language, "en");
        assert_eq!(out.translation.as_deref(), Some("hola"));
        assert_eq!(out.target_language.as_deref(), Some("es"));
        assert_eq!(out.duration_ms, 1200);
        assert!(out.tts_wav.is_some());
    }

    #[tokio::test]
    async fn test_same_language_relays_untranslated() {
        let caps = caps_with(
            MockTranscriber::new("m").with_response("hello").with_language("es"),
            MockTranslator::new().with_response("should not run"),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(Some("es"), true);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        pipeline.submit_final(one_second_pcm(), 500);

        let out = recv(&mut rx).await;
        assert_eq!(out.translation, None);
        assert_eq!(out.target_language, None);
        assert!(out.tts_wav.is_none());
    }

    #[tokio::test]
    async fn test_generations_are_monotonic_and_ordered() {
        let caps = caps_with(
            MockTranscriber::new("m").with_response("words"),
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(None, false);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        for i in 0..4u32 {
            pipeline.submit_final(one_second_pcm(), 100 * (i + 1));
        }

        for expected in 0..4u64 {
            let out = recv(&mut rx).await;
            assert_eq!(out.generation, expected);
        }
        assert_eq!(pipeline.generation(), 4);
    }

    #[tokio::test]
    async fn test_stale_partial_is_dropped() {
        let caps = caps_with(
            MockTranscriber::new("m")
                .with_response("interim")
                .with_delay(Duration::from_millis(150)),
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(None, false);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        // Launch a slow partial, then end the utterance before it returns.
        pipeline.maybe_submit_partial(one_second_pcm());
        pipeline.submit_final(one_second_pcm(), 1000);

        // Only the final (same slow transcriber) may arrive.
        let out = recv(&mut rx).await;
        assert_eq!(out.kind, OutputKind::Final);

        // Nothing else trails the final.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_at_most_one_partial_in_flight() {
        let caps = caps_with(
            MockTranscriber::new("m")
                .with_response("interim")
                .with_delay(Duration::from_millis(100)),
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(None, false);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        // Three attempts while the first is still running: two are skipped.
        pipeline.maybe_submit_partial(one_second_pcm());
        pipeline.maybe_submit_partial(one_second_pcm());
        pipeline.maybe_submit_partial(one_second_pcm());

        let out = recv(&mut rx).await;
        assert_eq!(out.kind, OutputKind::Partial);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());
        assert!(pipeline.partial_idle());
    }

    #[tokio::test]
    async fn test_short_snapshot_is_skipped() {
        let caps = caps_with(
            MockTranscriber::new("m"),
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(None, false);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        // Below the 1 s minimum
        pipeline.maybe_submit_partial(vec![0.1f32; 4000]);
        assert!(pipeline.partial_idle());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_asr_timeout_discards_utterance() {
        let caps = caps_with(
            MockTranscriber::new("m")
                .with_response("late")
                .with_delay(Duration::from_millis(400)),
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(None, false);
        let config = StageConfig {
            asr_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let pipeline = StagePipeline::new(caps, config, router, None);

        pipeline.submit_final(one_second_pcm(), 1000);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());
        // The generation still advanced; the session continues.
        assert_eq!(pipeline.generation(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_failed_utterance() {
        struct FlakyTranscriber {
            calls: std::sync::atomic::AtomicUsize,
        }

        impl Transcriber for FlakyTranscriber {
            fn transcribe(
                &self,
                _audio: &[f32],
                _language: Option<&str>,
            ) -> crate::error::Result<Transcript> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ParlanceError::Transcription {
                        message: "first call fails".to_string(),
                    })
                } else {
                    Ok(Transcript {
                        text: "recovered".to_string(),
                        language: Some("en".to_string()),
                    })
                }
            }

            fn model_name(&self) -> &str {
                "flaky"
            }

            fn is_ready(&self) -> bool {
                true
            }
        }

        let caps = caps_with(
            FlakyTranscriber {
                calls: std::sync::atomic::AtomicUsize::new(0),
            },
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(None, false);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        pipeline.submit_final(one_second_pcm(), 500);
        pipeline.submit_final(one_second_pcm(), 500);

        let out = recv(&mut rx).await;
        assert_eq!(out.text, "recovered");
        assert_eq!(out.generation, 1);
    }

    #[tokio::test]
    async fn test_empty_transcript_produces_nothing() {
        let caps = caps_with(
            MockTranscriber::new("m").with_response(""),
            MockTranslator::new(),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(Some("es"), true);
        let pipeline = StagePipeline::new(caps, StageConfig::default(), router, None);

        pipeline.submit_final(one_second_pcm(), 300);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_translation_knob() {
        let caps = caps_with(
            MockTranscriber::new("m").with_response("hello").with_language("en"),
            MockTranslator::new().with_response("hola"),
            MockSynthesizer::new(),
        );
        let (router, mut rx) = router(Some("es"), true);
        let config = StageConfig {
            partial_translation: true,
            ..Default::default()
        };
        let pipeline = StagePipeline::new(caps, config, router, None);

        pipeline.maybe_submit_partial(one_second_pcm());

        let out = recv(&mut rx).await;
        assert_eq!(out.kind, OutputKind::Partial);
        assert_eq!(out.translation.as_deref(), Some("hola"));
        assert_eq!(out.target_language.as_deref(), Some("es"));
        // Partials never carry audio
        assert!(out.tts_wav.is_none());
    }
}
