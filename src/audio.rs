//! Joining audio parts and producing silence.
//!
//! ffmpeg does the work when it is installed. Without it (or when it fails)
//! an in-process fallback keeps the pipeline running: WAV parts are merged
//! sample by sample with hound, anything else is concatenated byte for byte.

use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AudioFormat;
use crate::error::AssemblyError;

/// Sampling rate of the synthetic MP3 silence frames (MPEG-2 layer III).
const MP3_SILENCE_RATE: u32 = 24_000;
const MP3_SAMPLES_PER_FRAME: u32 = 576;
/// 32 kbit/s, 24 kHz, mono, no CRC, no padding.
const MP3_SILENT_HEADER: [u8; 4] = [0xFF, 0xF3, 0x44, 0xC0];
const MP3_FRAME_BYTES: usize = 96;

/// Whether `tool` is on the PATH.
pub fn tool_available(tool: &str) -> bool {
    ProcessCommand::new("which")
        .arg(tool)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[async_trait]
pub trait AudioAssembler: Send + Sync {
    /// Join `parts`, in the given order, into `output`.
    async fn concatenate(&self, parts: &[PathBuf], output: &Path) -> Result<(), AssemblyError>;

    async fn generate_silence(&self, duration: Duration, output: &Path) -> Result<(), AssemblyError>;
}

/// ffmpeg through its concat demuxer and `anullsrc` source.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    format: AudioFormat,
    sample_rate: u32,
}

impl FfmpegAssembler {
    pub fn detect(format: AudioFormat, sample_rate: u32) -> Option<Self> {
        if tool_available("ffmpeg") {
            Some(Self { format, sample_rate })
        } else {
            None
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<(), AssemblyError> {
        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AssemblyError::ToolUnavailable("ffmpeg"),
                _ => AssemblyError::Io(e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(AssemblyError::ToolFailed {
                tool: "ffmpeg",
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Entry of an ffmpeg concat list, with single quotes escaped.
fn concat_list_line(path: &Path) -> String {
    format!("file '{}'\n", path.to_string_lossy().replace('\'', "'\\''"))
}

#[async_trait]
impl AudioAssembler for FfmpegAssembler {
    async fn concatenate(&self, parts: &[PathBuf], output: &Path) -> Result<(), AssemblyError> {
        if parts.is_empty() {
            return Err(AssemblyError::NoParts(output.to_path_buf()));
        }

        let mut list = tempfile::Builder::new().suffix(".txt").tempfile()?;
        for part in parts {
            let absolute = fs::canonicalize(part)?;
            list.write_all(concat_list_line(&absolute).as_bytes())?;
        }
        list.flush()?;

        self.run(vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.path().to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().into_owned(),
        ])
        .await
    }

    async fn generate_silence(&self, duration: Duration, output: &Path) -> Result<(), AssemblyError> {
        let mut args: Vec<String> = vec![
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={}:cl=mono", self.sample_rate),
            "-t".into(),
            format!("{:.3}", duration.as_secs_f64()),
        ];
        match self.format {
            AudioFormat::Mp3 => args.extend(["-c:a", "libmp3lame", "-q:a", "4"].map(String::from)),
            AudioFormat::Wav => args.extend(["-c:a", "pcm_s16le"].map(String::from)),
        }
        args.push(output.to_string_lossy().into_owned());
        self.run(args).await
    }
}

/// Dependency-free assembler.
#[derive(Debug, Clone)]
pub struct FallbackAssembler {
    format: AudioFormat,
    sample_rate: u32,
}

impl FallbackAssembler {
    pub fn new(format: AudioFormat, sample_rate: u32) -> Self {
        Self { format, sample_rate }
    }
}

fn same_layout(a: &WavSpec, b: &WavSpec) -> bool {
    a.channels == b.channels
        && a.sample_rate == b.sample_rate
        && a.bits_per_sample == b.bits_per_sample
        && a.sample_format == b.sample_format
}

/// Merge WAV parts into one file with a correct header.
///
/// Streams written without a final length (espeak `--stdout`) are read up to
/// the point where samples run out. Returns `Ok(false)` when the parts do not
/// share one layout, leaving the decision to the caller.
fn merge_wav(parts: &[PathBuf], output: &Path) -> Result<bool, AssemblyError> {
    let mut readers = Vec::with_capacity(parts.len());
    for part in parts {
        readers.push(WavReader::open(part)?);
    }
    let spec = readers[0].spec();
    if readers.iter().any(|r| !same_layout(&r.spec(), &spec)) {
        return Ok(false);
    }

    let mut writer = WavWriter::create(output, spec)?;
    for reader in &mut readers {
        match spec.sample_format {
            SampleFormat::Int => {
                for sample in reader.samples::<i32>().map_while(Result::ok) {
                    writer.write_sample(sample)?;
                }
            }
            SampleFormat::Float => {
                for sample in reader.samples::<f32>().map_while(Result::ok) {
                    writer.write_sample(sample)?;
                }
            }
        }
    }
    writer.finalize()?;
    Ok(true)
}

fn concat_bytes(parts: &[PathBuf], output: &Path) -> Result<(), AssemblyError> {
    let mut out = BufWriter::new(File::create(output)?);
    for part in parts {
        let mut input = File::open(part)?;
        std::io::copy(&mut input, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

fn write_silent_wav(duration: Duration, sample_rate: u32, output: &Path) -> Result<(), AssemblyError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let samples = (duration.as_secs_f64() * sample_rate as f64).round() as u64;
    let mut writer = WavWriter::create(output, spec)?;
    for _ in 0..samples {
        writer.write_sample(0i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Number of silent MP3 frames covering `duration`.
pub fn mp3_silence_frames(duration: Duration) -> u64 {
    let per_second = MP3_SILENCE_RATE as f64 / MP3_SAMPLES_PER_FRAME as f64;
    (duration.as_secs_f64() * per_second).ceil().max(1.0) as u64
}

fn write_silent_mp3(duration: Duration, output: &Path) -> Result<(), AssemblyError> {
    let mut frame = [0u8; MP3_FRAME_BYTES];
    frame[..4].copy_from_slice(&MP3_SILENT_HEADER);

    let mut out = BufWriter::new(File::create(output)?);
    for _ in 0..mp3_silence_frames(duration) {
        out.write_all(&frame)?;
    }
    out.flush()?;
    Ok(())
}

#[async_trait]
impl AudioAssembler for FallbackAssembler {
    async fn concatenate(&self, parts: &[PathBuf], output: &Path) -> Result<(), AssemblyError> {
        if parts.is_empty() {
            return Err(AssemblyError::NoParts(output.to_path_buf()));
        }
        let parts = parts.to_vec();
        let output = output.to_path_buf();
        let format = self.format;

        tokio::task::spawn_blocking(move || {
            if format == AudioFormat::Wav {
                match merge_wav(&parts, &output) {
                    Ok(true) => return Ok(()),
                    Ok(false) => debug!("WAV parts differ in layout, joining raw bytes"),
                    Err(e) => debug!(error = %e, "WAV merge failed, joining raw bytes"),
                }
            }
            concat_bytes(&parts, &output)
        })
        .await
        .map_err(|e| AssemblyError::Worker(e.to_string()))?
    }

    async fn generate_silence(&self, duration: Duration, output: &Path) -> Result<(), AssemblyError> {
        let output = output.to_path_buf();
        let format = self.format;
        let sample_rate = self.sample_rate;

        tokio::task::spawn_blocking(move || match format {
            AudioFormat::Wav => write_silent_wav(duration, sample_rate, &output),
            AudioFormat::Mp3 => write_silent_mp3(duration, &output),
        })
        .await
        .map_err(|e| AssemblyError::Worker(e.to_string()))?
    }
}

/// ffmpeg when available, the in-process fallback otherwise or on failure.
pub struct ResilientAssembler {
    primary: Option<FfmpegAssembler>,
    fallback: FallbackAssembler,
}

impl ResilientAssembler {
    pub fn new(format: AudioFormat, sample_rate: u32) -> Self {
        let primary = FfmpegAssembler::detect(format, sample_rate);
        if primary.is_none() {
            warn!("ffmpeg not found, using built-in audio concatenation");
        }
        Self {
            primary,
            fallback: FallbackAssembler::new(format, sample_rate),
        }
    }

    pub fn fallback_only(format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            primary: None,
            fallback: FallbackAssembler::new(format, sample_rate),
        }
    }
}

#[async_trait]
impl AudioAssembler for ResilientAssembler {
    async fn concatenate(&self, parts: &[PathBuf], output: &Path) -> Result<(), AssemblyError> {
        if let Some(primary) = &self.primary {
            match primary.concatenate(parts, output).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "ffmpeg concatenation failed, falling back"),
            }
        }
        self.fallback.concatenate(parts, output).await
    }

    async fn generate_silence(&self, duration: Duration, output: &Path) -> Result<(), AssemblyError> {
        if let Some(primary) = &self.primary {
            match primary.generate_silence(duration, output).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "ffmpeg silence generation failed, falling back"),
            }
        }
        self.fallback.generate_silence(duration, output).await
    }
}
