//! Speech synthesis providers.
//!
//! The engine only sees [`SpeechProvider`]. The bundled implementation drives
//! espeak-ng (or espeak) as an external process; [`CachedProvider`] wraps any
//! provider with a content-addressed disk cache and [`VoiceCatalog`] keeps the
//! provider's voice list behind a lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audio::tool_available;
use crate::config::AudioFormat;
use crate::error::SynthesisError;

/// espeak's default speed in words per minute, i.e. a rate of `+0%`.
const BASE_WPM: f64 = 175.0;
const MIN_WPM: u32 = 80;
const MAX_WPM: u32 = 450;

/// Languages listed first in the voice catalog, in this order.
const LANGUAGE_PRIORITY: &[&str] = &["en", "it", "fr", "de", "es", "pt"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    /// Identifier passed back to [`SpeechProvider::synthesize`].
    pub id: String,
    pub name: String,
    pub locale: String,
    pub gender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceGroup {
    /// Language code (`en`, `fr`, ...).
    pub language: String,
    pub voices: Vec<Voice>,
}

/// Turns one chunk of text into encoded audio.
///
/// Calls must be safe to repeat: the engine retries failed chunks.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str, rate: &str) -> Result<Vec<u8>, SynthesisError>;

    async fn list_voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        Ok(Vec::new())
    }

    /// Container format of the returned audio.
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }
}

/// Map a rate modifier such as `"+25%"` or `"-10%"` to espeak words per minute.
pub fn words_per_minute(rate: &str) -> u32 {
    let percent = rate
        .trim()
        .trim_end_matches('%')
        .trim_start_matches('+')
        .parse::<f64>()
        .unwrap_or(0.0);
    let wpm = BASE_WPM * (1.0 + percent / 100.0);
    (wpm.round().max(0.0) as u32).clamp(MIN_WPM, MAX_WPM)
}

/// Parse the table printed by `espeak-ng --voices`.
pub fn parse_espeak_voices(listing: &str) -> Vec<Voice> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let locale = fields[1].to_string();
            let gender = match fields[2].rsplit('/').next() {
                Some("F") => "Female",
                Some("M") => "Male",
                _ => "Unknown",
            };
            Some(Voice {
                id: locale.clone(),
                name: fields[3].replace('_', " "),
                locale,
                gender: gender.to_string(),
            })
        })
        .collect()
}

/// Arguments for one synthesis call. The text follows `--` so dialogue
/// lines starting with a dash are not read as options.
pub fn espeak_args(text: &str, voice: &str, rate: &str) -> Vec<String> {
    vec![
        "-v".to_string(),
        voice.to_string(),
        "-s".to_string(),
        words_per_minute(rate).to_string(),
        "-a".to_string(),
        "100".to_string(),
        "--stdout".to_string(),
        "--".to_string(),
        text.to_string(),
    ]
}

/// espeak-ng / espeak command line synthesizer.
#[derive(Debug, Clone)]
pub struct EspeakProvider {
    program: &'static str,
    format: AudioFormat,
}

impl EspeakProvider {
    /// Find an installed espeak binary.
    pub fn detect(format: AudioFormat) -> Result<Self, SynthesisError> {
        for program in ["espeak-ng", "espeak"] {
            if tool_available(program) {
                info!(program, "Using speech engine");
                return Ok(Self { program, format });
            }
        }
        Err(SynthesisError::Unavailable(
            "No TTS engine found. Please install espeak-ng or espeak".to_string(),
        ))
    }

    async fn run_espeak(&self, text: &str, voice: &str, rate: &str) -> Result<Vec<u8>, SynthesisError> {
        let output = Command::new(self.program)
            .args(espeak_args(text, voice, rate))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(SynthesisError::Transient(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(SynthesisError::Transient(format!(
                "{} produced no audio",
                self.program
            )));
        }
        Ok(output.stdout)
    }

    /// WAV to MP3 through lame, or ffmpeg when lame is missing.
    async fn encode_mp3(&self, wav: Vec<u8>) -> Result<Vec<u8>, SynthesisError> {
        let input = tempfile::Builder::new().suffix(".wav").tempfile()?;
        let output = tempfile::Builder::new().suffix(".mp3").tempfile()?;
        tokio::fs::write(input.path(), &wav).await?;

        let mut cmd = if tool_available("lame") {
            let mut cmd = Command::new("lame");
            cmd.arg("--quiet").arg("-V").arg("4").arg(input.path()).arg(output.path());
            cmd
        } else if tool_available("ffmpeg") {
            let mut cmd = Command::new("ffmpeg");
            cmd.arg("-y")
                .arg("-loglevel")
                .arg("error")
                .arg("-i")
                .arg(input.path())
                .arg("-c:a")
                .arg("libmp3lame")
                .arg("-q:a")
                .arg("4")
                .arg(output.path());
            cmd
        } else {
            return Err(SynthesisError::Unavailable(
                "No MP3 encoder found. Please install lame or ffmpeg".to_string(),
            ));
        };

        let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status().await?;
        if !status.success() {
            return Err(SynthesisError::Transient(format!("MP3 encoding failed with {}", status)));
        }
        Ok(tokio::fs::read(output.path()).await?)
    }
}

#[async_trait]
impl SpeechProvider for EspeakProvider {
    async fn synthesize(&self, text: &str, voice: &str, rate: &str) -> Result<Vec<u8>, SynthesisError> {
        let wav = self.run_espeak(text, voice, rate).await?;
        match self.format {
            AudioFormat::Wav => Ok(wav),
            AudioFormat::Mp3 => self.encode_mp3(wav).await,
        }
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        let output = Command::new(self.program)
            .arg("--voices")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(SynthesisError::Unavailable(format!(
                "{} --voices exited with {}",
                self.program, output.status
            )));
        }
        Ok(parse_espeak_voices(&String::from_utf8_lossy(&output.stdout)))
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

/// Disk cache in front of another provider, keyed by SHA-256 of the request.
pub struct CachedProvider {
    inner: Arc<dyn SpeechProvider>,
    dir: PathBuf,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn SpeechProvider>, dir: impl Into<PathBuf>) -> Result<Self, SynthesisError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { inner, dir })
    }

    pub fn cache_key(text: &str, voice: &str, rate: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(voice.as_bytes());
        hasher.update([0u8]);
        hasher.update(rate.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key, self.inner.format().extension()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SpeechProvider for CachedProvider {
    async fn synthesize(&self, text: &str, voice: &str, rate: &str) -> Result<Vec<u8>, SynthesisError> {
        let key = Self::cache_key(text, voice, rate);
        let path = self.entry_path(&key);

        if let Ok(audio) = tokio::fs::read(&path).await {
            if !audio.is_empty() {
                debug!(key = %&key[..12], "Synthesis cache hit");
                return Ok(audio);
            }
        }

        let audio = self.inner.synthesize(text, voice, rate).await?;
        if let Err(e) = tokio::fs::write(&path, &audio).await {
            warn!(path = %path.display(), error = %e, "Could not store synthesis cache entry");
        }
        Ok(audio)
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        self.inner.list_voices().await
    }

    fn format(&self) -> AudioFormat {
        self.inner.format()
    }
}

/// Group voices by language: priority languages first, the rest by code.
pub fn group_voices(voices: Vec<Voice>) -> Vec<VoiceGroup> {
    let mut groups: Vec<VoiceGroup> = Vec::new();
    for voice in voices {
        let language = voice
            .locale
            .split(['-', '_'])
            .next()
            .unwrap_or("")
            .to_lowercase();
        match groups.iter_mut().find(|g| g.language == language) {
            Some(group) => group.voices.push(voice),
            None => groups.push(VoiceGroup {
                language,
                voices: vec![voice],
            }),
        }
    }

    for group in &mut groups {
        group
            .voices
            .sort_by(|a, b| (&a.gender, &a.name).cmp(&(&b.gender, &b.name)));
    }
    let rank = |language: &str| {
        LANGUAGE_PRIORITY
            .iter()
            .position(|p| *p == language)
            .unwrap_or(LANGUAGE_PRIORITY.len())
    };
    groups.sort_by(|a, b| {
        rank(&a.language)
            .cmp(&rank(&b.language))
            .then_with(|| a.language.cmp(&b.language))
    });
    groups
}

/// Lazily loaded, explicitly invalidated voice list of one provider.
pub struct VoiceCatalog {
    provider: Arc<dyn SpeechProvider>,
    cache: RwLock<Option<Arc<Vec<VoiceGroup>>>>,
}

impl VoiceCatalog {
    pub fn new(provider: Arc<dyn SpeechProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(None),
        }
    }

    /// Cached grouping, loading it on first use.
    pub async fn voices(&self) -> Result<Arc<Vec<VoiceGroup>>, SynthesisError> {
        if let Some(groups) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(groups));
        }

        let mut cache = self.cache.write().await;
        // Another caller may have loaded it while we waited for the lock.
        if let Some(groups) = cache.as_ref() {
            return Ok(Arc::clone(groups));
        }
        let groups = Arc::new(group_voices(self.provider.list_voices().await?));
        info!(languages = groups.len(), "Loaded voice catalog");
        *cache = Some(Arc::clone(&groups));
        Ok(groups)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    pub async fn refresh(&self) -> Result<Arc<Vec<VoiceGroup>>, SynthesisError> {
        self.invalidate().await;
        self.voices().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::TextNormalizer;
    use crate::planner::split_text_into_chunks;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dialogue_text_is_passed_after_option_terminator() {
        let normalized = TextNormalizer::default()
            .normalize("Lei lo guardò a lungo.\n\n\u{2014}Ciao, rispose lei.");
        let chunks = split_text_into_chunks(&normalized, 20);
        let dialogue = chunks
            .iter()
            .find(|chunk| chunk.starts_with('-'))
            .expect("a chunk opening with a dash");

        let args = espeak_args(dialogue, "it", "+0%");
        let n = args.len();
        assert_eq!(args[n - 2], "--");
        assert_eq!(&args[n - 1], dialogue);
        assert_eq!(&args[..n - 2], ["-v", "it", "-s", "175", "-a", "100", "--stdout"]);
    }

    struct CountingProvider {
        calls: AtomicUsize,
        voice_lists: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                voice_lists: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SpeechProvider for CountingProvider {
        async fn synthesize(&self, text: &str, _voice: &str, _rate: &str) -> Result<Vec<u8>, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(text.as_bytes().to_vec())
        }

        async fn list_voices(&self) -> Result<Vec<Voice>, SynthesisError> {
            self.voice_lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                voice("de-DE", "Karl", "Male"),
                voice("en-US", "Zoe", "Female"),
                voice("en-GB", "Adam", "Male"),
                voice("ja", "Aoi", "Female"),
                voice("it-IT", "Elsa", "Female"),
                voice("ar", "Amal", "Female"),
            ])
        }
    }

    fn voice(locale: &str, name: &str, gender: &str) -> Voice {
        Voice {
            id: format!("{}-{}", locale, name),
            name: name.to_string(),
            locale: locale.to_string(),
            gender: gender.to_string(),
        }
    }

    #[test]
    fn rate_modifiers_map_to_wpm() {
        assert_eq!(words_per_minute("+0%"), 175);
        assert_eq!(words_per_minute("+20%"), 210);
        assert_eq!(words_per_minute("-20%"), 140);
        assert_eq!(words_per_minute("garbage"), 175);
        assert_eq!(words_per_minute("-90%"), MIN_WPM);
        assert_eq!(words_per_minute("+500%"), MAX_WPM);
    }

    #[test]
    fn parses_espeak_voice_table() {
        let listing = "Pty Language       Age/Gender VoiceName          File                 Other Languages\n \
             5  af              --/M      Afrikaans          gmw/af\n \
             5  en-us           --/F      English_(America)  gmw/en-US            (en 10)\n";
        let voices = parse_espeak_voices(listing);
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[1].id, "en-us");
        assert_eq!(voices[1].name, "English (America)");
        assert_eq!(voices[1].gender, "Female");
        assert_eq!(voices[0].gender, "Male");
    }

    #[test]
    fn cache_key_separates_fields() {
        assert_ne!(
            CachedProvider::cache_key("ab", "c", "+0%"),
            CachedProvider::cache_key("a", "bc", "+0%")
        );
        assert_eq!(CachedProvider::cache_key("x", "en", "+0%").len(), 64);
    }

    #[tokio::test]
    async fn cached_provider_reuses_audio() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(CountingProvider::new());
        let cached = CachedProvider::new(inner.clone(), dir.path().join("cache")).unwrap();

        let first = cached.synthesize("hello", "en", "+0%").await.unwrap();
        let second = cached.synthesize("hello", "en", "+0%").await.unwrap();
        let other = cached.synthesize("hello", "fr", "+0%").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(other, b"hello".to_vec());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn catalog_groups_by_priority_and_caches() {
        let provider = Arc::new(CountingProvider::new());
        let catalog = VoiceCatalog::new(provider.clone());

        let groups = catalog.voices().await.unwrap();
        let languages: Vec<&str> = groups.iter().map(|g| g.language.as_str()).collect();
        assert_eq!(languages, vec!["en", "it", "de", "ar", "ja"]);
        let english: Vec<&str> = groups[0].voices.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(english, vec!["Zoe", "Adam"]);

        catalog.voices().await.unwrap();
        assert_eq!(provider.voice_lists.load(Ordering::SeqCst), 1);

        catalog.refresh().await.unwrap();
        assert_eq!(provider.voice_lists.load(Ordering::SeqCst), 2);

        catalog.invalidate().await;
        catalog.voices().await.unwrap();
        assert_eq!(provider.voice_lists.load(Ordering::SeqCst), 3);
    }
}
