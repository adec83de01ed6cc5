use async_trait::async_trait;
use audiobook_maker::audio::FallbackAssembler;
use audiobook_maker::job::CancelReason;
use audiobook_maker::provider::SpeechProvider;
use audiobook_maker::{
    AudioFormat, BookInfo, Chapter, Config, GenerateRequest, JobOutcome, JobStatus, OutputMode,
    SynthesisEngine, SynthesisError, SynthesisJob,
};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

const RATE: u32 = 8000;
const CHUNK_SAMPLES: usize = 400;

fn config() -> Config {
    Config {
        sample_rate: RATE,
        chapter_silence_secs: 0.1,
        placeholder_silence_secs: 0.25,
        backoff_base_ms: 10,
        ..Config::default()
    }
}

fn wav_bytes(value: i16, samples: usize) -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..samples {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// First number in the text, i.e. the part number of "Part N." chunks.
fn part_number(text: &str) -> usize {
    text.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap()
}

fn book(parts: usize) -> BookInfo {
    let chapters = (1..=parts)
        .map(|i| Chapter::new(i, format!("Part {}", i), "Body of this part, told briefly.", "book.xhtml"))
        .collect();
    BookInfo::new("Scripted Book", "Tester", chapters)
}

/// Answers every chunk with a tone of amplitude `100 * part`, except the
/// parts listed in `failing`, and records call times.
struct ScriptedProvider {
    failing: Vec<usize>,
    /// Number of failures before a failing part succeeds; `usize::MAX` never.
    failures_before_success: usize,
    attempts: Mutex<Vec<(usize, Instant)>>,
}

impl ScriptedProvider {
    fn new(failing: Vec<usize>, failures_before_success: usize) -> Self {
        Self {
            failing,
            failures_before_success,
            attempts: Mutex::new(Vec::new()),
        }
    }

    fn calls_for(&self, part: usize) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == part)
            .map(|(_, t)| *t)
            .collect()
    }
}

#[async_trait]
impl SpeechProvider for ScriptedProvider {
    async fn synthesize(&self, text: &str, _voice: &str, _rate: &str) -> Result<Vec<u8>, SynthesisError> {
        let part = part_number(text);
        let previous = {
            let mut attempts = self.attempts.lock().unwrap();
            let previous = attempts.iter().filter(|(p, _)| *p == part).count();
            attempts.push((part, Instant::now()));
            previous
        };
        if self.failing.contains(&part) && previous < self.failures_before_success {
            return Err(SynthesisError::Transient(format!("part {} unavailable", part)));
        }
        Ok(wav_bytes(100 * part as i16, CHUNK_SAMPLES))
    }
}

fn engine(provider: Arc<dyn SpeechProvider>, config: &Config) -> Arc<SynthesisEngine> {
    Arc::new(SynthesisEngine::new(
        provider,
        Arc::new(FallbackAssembler::new(AudioFormat::Wav, RATE)),
        config,
    ))
}

fn samples(path: &Path) -> Vec<i16> {
    WavReader::open(path)
        .unwrap()
        .samples::<i16>()
        .map(|s| s.unwrap())
        .collect()
}

fn tones(samples: &[i16]) -> Vec<i16> {
    let mut runs: Vec<i16> = Vec::new();
    for s in samples {
        if runs.last() != Some(s) {
            runs.push(*s);
        }
    }
    runs.into_iter().filter(|s| *s != 0).collect()
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_use_real_audio() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        backoff_base_ms: 1000,
        ..config()
    };
    let provider = Arc::new(ScriptedProvider::new(vec![2], 2));
    let job = Arc::new(SynthesisJob::new("backoff", book(3)));

    let outcome = engine(provider.clone(), &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, dir.path()))
        .await
        .unwrap();

    let JobOutcome::Done { artifacts, failed_chunks, .. } = outcome else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(failed_chunks, 0);

    let calls = provider.calls_for(2);
    assert_eq!(calls.len(), 3);
    let first_wait = calls[1] - calls[0];
    let second_wait = calls[2] - calls[1];
    assert!(first_wait >= Duration::from_secs(1) && first_wait < Duration::from_millis(1100));
    assert!(second_wait >= Duration::from_secs(2) && second_wait < Duration::from_millis(2100));

    assert_eq!(tones(&samples(&artifacts[0])), vec![100, 200, 300]);
}

#[tokio::test]
async fn exhausted_chunk_becomes_silence_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let provider = Arc::new(ScriptedProvider::new(vec![5], usize::MAX));
    let job = Arc::new(SynthesisJob::new("ten", book(10)));

    let outcome = engine(provider.clone(), &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, dir.path()))
        .await
        .unwrap();

    let JobOutcome::Done { artifacts, failed_chunks, .. } = outcome else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(failed_chunks, 1);
    assert_eq!(provider.calls_for(5).len(), 3);
    assert_eq!(artifacts, vec![dir.path().join("Scripted_Book.wav")]);

    let audio = samples(&artifacts[0]);
    assert_eq!(tones(&audio), vec![100, 200, 300, 400, 600, 700, 800, 900, 1000]);
    // Ten chapter lead-ins, nine real chunks and one placeholder.
    let expected = 10 * 800 + 9 * CHUNK_SAMPLES + 2000;
    assert_eq!(audio.len(), expected);

    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Done);
    assert_eq!(snapshot.failed_chunks, 1);
    assert_eq!(snapshot.processed_chars, snapshot.total_chars);
    assert!(snapshot.bytes_generated > 0);
    assert_eq!(snapshot.outputs.len(), 1);

    // Only the artifact is left behind.
    assert_eq!(entries(dir.path()), 1);
}

#[tokio::test]
async fn provider_that_always_fails_still_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let provider = Arc::new(ScriptedProvider::new((1..=4).collect(), usize::MAX));
    let job = Arc::new(SynthesisJob::new("silent", book(4)));

    let outcome = engine(provider, &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, dir.path()))
        .await
        .unwrap();

    let JobOutcome::Done { artifacts, failed_chunks, .. } = outcome else {
        panic!("unexpected outcome {:?}", outcome);
    };
    assert_eq!(failed_chunks, 4);
    assert_eq!(job.snapshot().total_chunks, 4);

    let reader = WavReader::open(&artifacts[0]).unwrap();
    assert_eq!(reader.duration() as usize, 4 * 800 + 4 * 2000);
    assert_eq!(job.status(), JobStatus::Done);
}

#[tokio::test]
async fn missing_output_dir_is_created_and_placeholders_counted() {
    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("library").join("new shelf");
    let config = config();
    let provider = Arc::new(ScriptedProvider::new((1..=4).collect(), usize::MAX));
    let job = Arc::new(SynthesisJob::new("fresh", book(4)));

    let outcome = engine(provider, &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, &output_dir))
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Done { failed_chunks: 4, .. }));
    assert!(output_dir.join("Scripted_Book.wav").exists());
    assert_eq!(entries(&output_dir), 1);
    // Four 0.25 s placeholders of 16-bit mono audio plus their headers.
    let bytes = job.snapshot().bytes_generated;
    assert!((4 * 4000..4 * 4100).contains(&bytes), "{} bytes", bytes);
}

/// Requests cancellation of its job after a fixed number of calls.
struct CancellingProvider {
    job: OnceLock<Arc<SynthesisJob>>,
    cancel_after: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl SpeechProvider for CancellingProvider {
    async fn synthesize(&self, text: &str, _voice: &str, _rate: &str) -> Result<Vec<u8>, SynthesisError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls == self.cancel_after {
            if let Some(job) = self.job.get() {
                job.cancel(false);
            }
        }
        Ok(wav_bytes(100 * part_number(text) as i16, CHUNK_SAMPLES))
    }
}

#[tokio::test]
async fn cancellation_discards_partial_chapters() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let provider = Arc::new(CancellingProvider {
        job: OnceLock::new(),
        cancel_after: 3,
        calls: AtomicUsize::new(0),
    });
    let job = Arc::new(SynthesisJob::new("cancel", book(6)));
    provider.job.set(Arc::clone(&job)).unwrap();

    let outcome = engine(provider.clone(), &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::PerChapter, dir.path()))
        .await
        .unwrap();

    assert_eq!(outcome, JobOutcome::Cancelled(CancelReason::Requested));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert!(snapshot.outputs.is_empty());
    assert_eq!(entries(dir.path()), 0);
}

/// Takes `delay` of (virtual) time per chunk.
struct SlowProvider {
    delay: Duration,
}

#[async_trait]
impl SpeechProvider for SlowProvider {
    async fn synthesize(&self, text: &str, _voice: &str, _rate: &str) -> Result<Vec<u8>, SynthesisError> {
        tokio::time::sleep(self.delay).await;
        Ok(wav_bytes(100 * part_number(text) as i16, CHUNK_SAMPLES))
    }
}

#[tokio::test(start_paused = true)]
async fn abandoned_job_is_cancelled_by_liveness_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let provider = Arc::new(SlowProvider {
        delay: Duration::from_secs(40),
    });
    let job = Arc::new(SynthesisJob::new("abandoned", book(4)));

    let outcome = engine(provider, &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, dir.path()))
        .await
        .unwrap();

    assert_eq!(outcome, JobOutcome::Cancelled(CancelReason::Abandoned));
    // Two chunks fit in the 60s window; the third checkpoint sees 80s of silence.
    assert_eq!(job.snapshot().processed_chars, {
        let plan_chars: Vec<usize> = audiobook_maker::planner::ChunkPlanner::new(config.chunk_max_chars)
            .plan_book(job.book())
            .iter()
            .map(|e| e.char_count)
            .collect();
        plan_chars[0] + plan_chars[1]
    });
    assert_eq!(entries(dir.path()), 0);
}

#[tokio::test(start_paused = true)]
async fn registered_notification_keeps_job_alive() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let provider = Arc::new(SlowProvider {
        delay: Duration::from_secs(40),
    });
    let job = Arc::new(SynthesisJob::new("notified", book(4)));
    job.register_notification();

    let outcome = engine(provider, &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, dir.path()))
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Done { failed_chunks: 0, .. }));
    // An unforced cancel after registration is ignored.
    assert!(!job.cancel(false));
}

struct PanickingProvider;

#[async_trait]
impl SpeechProvider for PanickingProvider {
    async fn synthesize(&self, _text: &str, _voice: &str, _rate: &str) -> Result<Vec<u8>, SynthesisError> {
        panic!("provider bug");
    }
}

#[tokio::test]
async fn crashed_worker_ends_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let job = Arc::new(SynthesisJob::new("crash", book(2)));

    let outcome = engine(Arc::new(PanickingProvider), &config)
        .start(Arc::clone(&job), GenerateRequest::new(&config, OutputMode::SingleFile, dir.path()))
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Failed(_)));
    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Error);
    assert!(snapshot.error.unwrap().contains("crashed"));
}

#[tokio::test]
async fn chapter_mode_renders_only_selected_chapters() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let provider = Arc::new(ScriptedProvider::new(Vec::new(), 0));
    let job = Arc::new(SynthesisJob::new("selection", book(4)));

    let mut request = GenerateRequest::new(&config, OutputMode::PerChapter, dir.path());
    request.chapters = Some(vec![4, 2]);
    let outcome = engine(provider.clone(), &config)
        .start(Arc::clone(&job), request)
        .await
        .unwrap();

    let JobOutcome::Done { artifacts, .. } = outcome else {
        panic!("unexpected outcome {:?}", outcome);
    };
    let chapters = dir.path().join("Scripted_Book_chapters");
    assert_eq!(
        artifacts,
        vec![
            chapters.join("002_Part_2.wav"),
            chapters.join("004_Part_4.wav"),
            chapters.join("playlist.m3u"),
            dir.path().join("Scripted_Book_chapters.zip"),
        ]
    );
    assert_eq!(tones(&samples(&artifacts[1])), vec![400]);
    assert_eq!(samples(&artifacts[1]).len(), 800 + CHUNK_SAMPLES);
    assert!(provider.calls_for(1).is_empty());
}

#[tokio::test]
async fn empty_selection_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let job = Arc::new(SynthesisJob::new("empty", book(2)));

    let mut request = GenerateRequest::new(&config, OutputMode::PerChapter, dir.path());
    request.chapters = Some(vec![9]);
    let outcome = engine(Arc::new(ScriptedProvider::new(Vec::new(), 0)), &config)
        .start(Arc::clone(&job), request)
        .await
        .unwrap();

    assert_eq!(outcome, JobOutcome::Failed("No chapters selected".to_string()));
    assert_eq!(job.status(), JobStatus::Error);
}
