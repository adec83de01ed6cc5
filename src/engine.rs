//! The synthesis engine: walks a chunk plan in order, one provider call at a
//! time, and hands the resulting parts to the [`ArtifactAssembler`].
//!
//! A job ends in exactly one of `done`, `error` or `cancelled`. Chunk-level
//! failures never end a job: after the retry budget is spent the chunk is
//! replaced by a short silence and counted in `failed_chunks`.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactAssembler;
use crate::audio::AudioAssembler;
use crate::config::{AudioFormat, Config, RetryPolicy};
use crate::error::PipelineError;
use crate::job::{CancelReason, JobStatus, OutputMode, SynthesisJob};
use crate::model::{BookInfo, ChunkPlanEntry};
use crate::planner::ChunkPlanner;
use crate::provider::SpeechProvider;

/// What the caller asks a job to produce.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub voice: String,
    pub rate: String,
    pub output_mode: OutputMode,
    /// Chapter indices to render. Honoured in per-chapter mode only.
    pub chapters: Option<Vec<usize>>,
    pub output_dir: PathBuf,
}

impl GenerateRequest {
    pub fn new(config: &Config, output_mode: OutputMode, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            voice: config.voice.clone(),
            rate: config.rate.clone(),
            output_mode,
            chapters: None,
            output_dir: output_dir.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderReason {
    /// Nothing left to say after sanitization.
    EmptyText,
    Exhausted { attempts: u32, last_error: String },
}

/// Result of one plan entry: real audio or a silent stand-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Synthesized { bytes: u64, attempts: u32 },
    Placeholder { reason: PlaceholderReason },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done {
        artifacts: Vec<PathBuf>,
        failed_chunks: usize,
        elapsed: Duration,
    },
    Cancelled(CancelReason),
    Failed(String),
}

fn control_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F\u{200B}-\u{200F}\u{2028}-\u{202F}\u{FEFF}]")
            .unwrap()
    })
}

fn blank_line_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

fn space_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" {3,}").unwrap())
}

/// Last cleanup before text reaches the provider.
pub fn sanitize_chunk_text(text: &str) -> String {
    let text = control_chars().replace_all(text, "");
    let text = text.replace("\r\n", "\n");
    let text = blank_line_runs().replace_all(&text, "\n\n");
    let text = space_runs().replace_all(&text, " ");
    text.trim().to_string()
}

/// Reusable silence file, generated on first use.
struct SharedSilence {
    duration: Duration,
    name: &'static str,
    path: Option<PathBuf>,
}

impl SharedSilence {
    fn new(name: &'static str, duration: Duration) -> Self {
        Self {
            duration,
            name,
            path: None,
        }
    }

    async fn get(
        &mut self,
        assembler: &dyn AudioAssembler,
        dir: &Path,
        format: AudioFormat,
    ) -> Result<PathBuf, PipelineError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let path = dir.join(format!("{}.{}", self.name, format.extension()));
        assembler.generate_silence(self.duration, &path).await?;
        self.path = Some(path.clone());
        Ok(path)
    }
}

pub struct SynthesisEngine {
    provider: Arc<dyn SpeechProvider>,
    assembler: Arc<dyn AudioAssembler>,
    planner: ChunkPlanner,
    retry: RetryPolicy,
    liveness_timeout: Duration,
    chapter_silence: Duration,
    placeholder_silence: Duration,
}

impl SynthesisEngine {
    pub fn new(
        provider: Arc<dyn SpeechProvider>,
        assembler: Arc<dyn AudioAssembler>,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            assembler,
            planner: ChunkPlanner::new(config.chunk_max_chars),
            retry: config.retry_policy(),
            liveness_timeout: config.liveness_timeout(),
            chapter_silence: config.chapter_silence(),
            placeholder_silence: config.placeholder_silence(),
        }
    }

    /// Run the job on its own task. The returned handle always resolves to an
    /// outcome; a panic inside the job is reported as a failure.
    pub fn start(self: &Arc<Self>, job: Arc<SynthesisJob>, request: GenerateRequest) -> JoinHandle<JobOutcome> {
        let engine = Arc::clone(self);
        let worker_job = Arc::clone(&job);
        let worker = tokio::spawn(async move { engine.run(&worker_job, request).await });

        tokio::spawn(async move {
            match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("Synthesis worker crashed: {}", e);
                    error!(job = %job.id(), "{}", message);
                    job.fail(message.clone());
                    JobOutcome::Failed(message)
                }
            }
        })
    }

    /// Run the job to a terminal state on the current task.
    pub async fn run(&self, job: &SynthesisJob, request: GenerateRequest) -> JobOutcome {
        match self.execute(job, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                error!(job = %job.id(), error = %message, "Synthesis failed");
                job.fail(message.clone());
                JobOutcome::Failed(message)
            }
        }
    }

    fn book_for(&self, job: &SynthesisJob, request: &GenerateRequest) -> Result<BookInfo, PipelineError> {
        match (&request.chapters, request.output_mode) {
            (Some(indices), OutputMode::PerChapter) => job.book().select(indices),
            _ => Ok(job.book().clone()),
        }
    }

    async fn execute(&self, job: &SynthesisJob, request: &GenerateRequest) -> Result<JobOutcome, PipelineError> {
        let book = self.book_for(job, request)?;
        let plan = self.planner.plan_book(&book);
        let total_chars = plan.iter().map(|e| e.char_count).sum();

        if !job.begin(plan.len(), total_chars) {
            // Only a cancel before start moves a job out of `analyzed`.
            return Ok(match job.status() {
                JobStatus::Cancelled => JobOutcome::Cancelled(CancelReason::Requested),
                status => JobOutcome::Failed(format!("Job cannot start from status {:?}", status)),
            });
        }
        let started = Instant::now();
        info!(
            job = %job.id(),
            book = %book.title,
            chapters = book.chapters.len(),
            chunks = plan.len(),
            mode = ?request.output_mode,
            "Synthesis started"
        );

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let workdir = tempfile::Builder::new()
            .prefix(".parts_")
            .tempdir_in(&request.output_dir)?;
        let format = self.provider.format();

        let mut artifacts = ArtifactAssembler::new(
            Arc::clone(&self.assembler),
            request.output_mode,
            &request.output_dir,
            &book.title,
            format,
        );
        let chapters: Vec<usize> = plan
            .iter()
            .map(|e| e.chapter_index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut chapter_silence = SharedSilence::new("_chapter_silence", self.chapter_silence);
        let mut placeholder = SharedSilence::new("_placeholder_silence", self.placeholder_silence);
        let mut previous_chapter = None;

        for (i, entry) in plan.iter().enumerate() {
            if let Some(reason) = job.cancellation_requested(self.liveness_timeout) {
                info!(job = %job.id(), chunk = i, ?reason, "Synthesis cancelled");
                artifacts.discard();
                job.mark_cancelled(reason);
                return Ok(JobOutcome::Cancelled(reason));
            }

            let chapter_position = chapters
                .iter()
                .position(|c| *c == entry.chapter_index)
                .map_or(0, |p| p + 1);
            job.update(i, entry.chapter_index, progress_message(entry, chapter_position, chapters.len()));

            let step = self
                .process_entry(
                    entry,
                    i,
                    request,
                    workdir.path(),
                    format,
                    &mut artifacts,
                    &mut previous_chapter,
                    &mut chapter_silence,
                    &mut placeholder,
                )
                .await;
            let (outcome, bytes) = match step {
                Ok(result) => result,
                Err(e) => {
                    artifacts.discard();
                    return Err(e);
                }
            };

            let failed = matches!(
                outcome,
                ChunkOutcome::Placeholder {
                    reason: PlaceholderReason::Exhausted { .. }
                }
            );
            job.record_chunk(entry.char_count, bytes, failed);
        }

        job.update(plan.len(), previous_chapter.unwrap_or(0), "Assembling audio".to_string());
        let outputs = artifacts.finish().await?;
        drop(workdir);

        let failed_chunks = job.snapshot().failed_chunks;
        job.finish(outputs.iter().map(|p| p.display().to_string()).collect());
        let elapsed = started.elapsed();
        info!(
            job = %job.id(),
            failed_chunks,
            elapsed_secs = elapsed.as_secs_f64(),
            "Synthesis finished"
        );
        Ok(JobOutcome::Done {
            artifacts: outputs,
            failed_chunks,
            elapsed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_entry(
        &self,
        entry: &ChunkPlanEntry,
        position: usize,
        request: &GenerateRequest,
        workdir: &Path,
        format: AudioFormat,
        artifacts: &mut ArtifactAssembler,
        previous_chapter: &mut Option<usize>,
        chapter_silence: &mut SharedSilence,
        placeholder: &mut SharedSilence,
    ) -> Result<(ChunkOutcome, u64), PipelineError> {
        if *previous_chapter != Some(entry.chapter_index) {
            artifacts
                .begin_chapter(entry.chapter_index, &entry.chapter_title)
                .await?;
            if !chapter_silence.duration.is_zero() {
                let silence = chapter_silence
                    .get(self.assembler.as_ref(), workdir, format)
                    .await?;
                artifacts.push_shared(silence);
            }
            *previous_chapter = Some(entry.chapter_index);
        }

        let part = workdir.join(format!("part_{:05}.{}", position, format.extension()));
        let outcome = self.synthesize_chunk(&entry.text, request, &part).await?;
        match &outcome {
            ChunkOutcome::Synthesized { bytes, .. } => {
                let bytes = *bytes;
                artifacts.push(part);
                Ok((outcome, bytes))
            }
            ChunkOutcome::Placeholder { reason } => {
                if let PlaceholderReason::Exhausted { attempts, last_error } = reason {
                    warn!(
                        chapter = entry.chapter_index,
                        chunk = entry.chunk_index,
                        attempts,
                        error = %last_error,
                        "Chunk skipped, inserting silence"
                    );
                }
                let silence = placeholder
                    .get(self.assembler.as_ref(), workdir, format)
                    .await?;
                let bytes = tokio::fs::metadata(&silence)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                artifacts.push_shared(silence);
                Ok((outcome, bytes))
            }
        }
    }

    /// Synthesize one chunk into `part`, retrying with backoff.
    pub async fn synthesize_chunk(
        &self,
        text: &str,
        request: &GenerateRequest,
        part: &Path,
    ) -> Result<ChunkOutcome, PipelineError> {
        let text = sanitize_chunk_text(text);
        if text.is_empty() {
            debug!(part = %part.display(), "Empty chunk after sanitization");
            return Ok(ChunkOutcome::Placeholder {
                reason: PlaceholderReason::EmptyText,
            });
        }

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            match self
                .provider
                .synthesize(&text, &request.voice, &request.rate)
                .await
            {
                Ok(audio) if !audio.is_empty() => {
                    tokio::fs::write(part, &audio).await?;
                    return Ok(ChunkOutcome::Synthesized {
                        bytes: audio.len() as u64,
                        attempts: attempt + 1,
                    });
                }
                Ok(_) => last_error = "provider returned no audio".to_string(),
                Err(e) => last_error = e.to_string(),
            }

            warn!(
                attempt = attempt + 1,
                max_attempts = self.retry.max_attempts,
                error = %last_error,
                "Synthesis attempt failed"
            );
            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        Ok(ChunkOutcome::Placeholder {
            reason: PlaceholderReason::Exhausted {
                attempts: self.retry.max_attempts,
                last_error,
            },
        })
    }
}

fn progress_message(entry: &ChunkPlanEntry, chapter_position: usize, chapter_count: usize) -> String {
    format!(
        "Chapter {}/{} \"{}\": chunk {}/{}",
        chapter_position,
        chapter_count,
        entry.chapter_title,
        entry.chunk_index + 1,
        entry.chunks_in_chapter
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FallbackAssembler;
    use crate::error::SynthesisError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then echoes the text.
    struct Flaky {
        failures: usize,
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl SpeechProvider for Flaky {
        async fn synthesize(&self, text: &str, _voice: &str, _rate: &str) -> Result<Vec<u8>, SynthesisError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            if calls.len() <= self.failures {
                Err(SynthesisError::Transient("busy".to_string()))
            } else {
                Ok(text.as_bytes().to_vec())
            }
        }

        fn format(&self) -> AudioFormat {
            AudioFormat::Mp3
        }
    }

    fn engine(provider: Arc<dyn SpeechProvider>) -> SynthesisEngine {
        let assembler = Arc::new(FallbackAssembler::new(AudioFormat::Mp3, 22050));
        SynthesisEngine::new(provider, assembler, &Config::default())
    }

    fn request(dir: &Path) -> GenerateRequest {
        GenerateRequest::new(&Config::default(), OutputMode::SingleFile, dir)
    }

    #[test]
    fn sanitization_strips_invisible_characters() {
        let text = "Hello\u{200B} wo\u{0007}rld\u{2028}!\n\n\n\n\nNext    line\tend\u{FEFF}";
        assert_eq!(sanitize_chunk_text(text), "Hello world!\n\nNext line\tend");
        assert_eq!(sanitize_chunk_text("\u{200B}\u{200C} \u{FEFF}"), "");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(Flaky {
            failures: 2,
            calls: Mutex::new(Vec::new()),
        });
        let engine = engine(provider.clone());
        let part = dir.path().join("part.mp3");

        let outcome = engine
            .synthesize_chunk("Some words.", &request(dir.path()), &part)
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Synthesized { bytes: 11, attempts: 3 });
        assert_eq!(std::fs::read(&part).unwrap(), b"Some words.");

        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let first_wait = calls[1] - calls[0];
        let second_wait = calls[2] - calls[1];
        assert!(first_wait >= Duration::from_secs(1) && first_wait < Duration::from_millis(1100));
        assert!(second_wait >= Duration::from_secs(2) && second_wait < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(Flaky {
            failures: usize::MAX,
            calls: Mutex::new(Vec::new()),
        });
        let outcome = engine(provider.clone())
            .synthesize_chunk("Words.", &request(dir.path()), &dir.path().join("p.mp3"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ChunkOutcome::Placeholder {
                reason: PlaceholderReason::Exhausted {
                    attempts: 3,
                    last_error: "Transient synthesis failure: busy".to_string(),
                }
            }
        );
        assert_eq!(provider.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_text_never_reaches_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(Flaky {
            failures: 0,
            calls: Mutex::new(Vec::new()),
        });
        let outcome = engine(provider.clone())
            .synthesize_chunk(" \u{200B}\u{0003} ", &request(dir.path()), &dir.path().join("p.mp3"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Placeholder {
                reason: PlaceholderReason::EmptyText
            }
        );
        assert!(provider.calls.lock().unwrap().is_empty());
    }
}
