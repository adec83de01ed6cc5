//! Turning the ordered audio parts of a job into final files.

use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::audio::AudioAssembler;
use crate::config::AudioFormat;
use crate::error::PipelineError;
use crate::job::OutputMode;

const MAX_FILENAME_CHARS: usize = 100;
const MAX_CHAPTER_TITLE_CHARS: usize = 50;
const DEFAULT_BOOK_NAME: &str = "audiobook";
const PLAYLIST_FILE: &str = "playlist.m3u";

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap())
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Make a title safe to use as a file name: path-unsafe characters removed,
/// whitespace collapsed to `_`, at most 100 characters.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = unsafe_chars().replace_all(name, "");
    let joined = whitespace_runs().replace_all(cleaned.trim(), "_");
    let capped: String = joined.chars().take(MAX_FILENAME_CHARS).collect();
    capped.trim_matches(['.', '_']).to_string()
}

/// `007_The_Storm`; order is carried by the zero-padded index.
pub fn chapter_file_stem(index: usize, title: &str) -> String {
    let title: String = sanitize_filename(title)
        .chars()
        .take(MAX_CHAPTER_TITLE_CHARS)
        .collect();
    let title = title.trim_end_matches(['.', '_']);
    if title.is_empty() {
        format!("{:03}_chapter", index)
    } else {
        format!("{:03}_{}", index, title)
    }
}

pub fn book_file_stem(title: &str) -> String {
    let stem = sanitize_filename(title);
    if stem.is_empty() {
        DEFAULT_BOOK_NAME.to_string()
    } else {
        stem
    }
}

#[derive(Debug)]
struct Part {
    path: PathBuf,
    /// Reusable asset such as a shared silence; never deleted here.
    shared: bool,
}

/// Collects the parts of one job and assembles them, per book or per chapter.
pub struct ArtifactAssembler {
    assembler: Arc<dyn AudioAssembler>,
    mode: OutputMode,
    output_dir: PathBuf,
    book_stem: String,
    extension: &'static str,
    parts: Vec<Part>,
    chapter: Option<(usize, String)>,
    chapter_files: Vec<PathBuf>,
    written: HashSet<PathBuf>,
}

impl ArtifactAssembler {
    pub fn new(
        assembler: Arc<dyn AudioAssembler>,
        mode: OutputMode,
        output_dir: impl Into<PathBuf>,
        book_title: &str,
        format: AudioFormat,
    ) -> Self {
        Self {
            assembler,
            mode,
            output_dir: output_dir.into(),
            book_stem: book_file_stem(book_title),
            extension: format.extension(),
            parts: Vec::new(),
            chapter: None,
            chapter_files: Vec::new(),
            written: HashSet::new(),
        }
    }

    fn chapter_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_chapters", self.book_stem))
    }

    /// Start collecting parts of a new chapter. In per-chapter mode the
    /// previous chapter is assembled first.
    pub async fn begin_chapter(&mut self, index: usize, title: &str) -> Result<(), PipelineError> {
        if self.mode == OutputMode::PerChapter {
            self.finalize_chapter().await?;
        }
        self.chapter = Some((index, title.to_string()));
        Ok(())
    }

    /// Append a part owned by this assembler; it is deleted once assembled.
    pub fn push(&mut self, path: PathBuf) {
        self.parts.push(Part { path, shared: false });
    }

    pub fn push_shared(&mut self, path: PathBuf) {
        self.parts.push(Part { path, shared: true });
    }

    fn remove_parts(&mut self) {
        for part in self.parts.drain(..) {
            if !part.shared {
                if let Err(e) = fs::remove_file(&part.path) {
                    debug!(path = %part.path.display(), error = %e, "Could not remove audio part");
                }
            }
        }
    }

    async fn finalize_chapter(&mut self) -> Result<(), PipelineError> {
        let Some((index, title)) = self.chapter.take() else {
            return Ok(());
        };
        if self.parts.is_empty() {
            return Ok(());
        }

        let dir = self.chapter_dir();
        fs::create_dir_all(&dir)?;
        let output = dir.join(format!("{}.{}", chapter_file_stem(index, &title), self.extension));
        let paths: Vec<PathBuf> = self.parts.iter().map(|p| p.path.clone()).collect();

        self.written.insert(output.clone());
        self.assembler.concatenate(&paths, &output).await?;
        debug!(chapter = index, output = %output.display(), parts = paths.len(), "Chapter assembled");

        self.remove_parts();
        self.chapter_files.push(output);
        Ok(())
    }

    /// Assemble whatever is left and return the finished artifacts.
    pub async fn finish(mut self) -> Result<Vec<PathBuf>, PipelineError> {
        fs::create_dir_all(&self.output_dir)?;
        match self.mode {
            OutputMode::SingleFile => {
                let output = self
                    .output_dir
                    .join(format!("{}.{}", self.book_stem, self.extension));
                let paths: Vec<PathBuf> = self.parts.iter().map(|p| p.path.clone()).collect();
                self.written.insert(output.clone());
                if let Err(e) = self.assembler.concatenate(&paths, &output).await {
                    self.discard();
                    return Err(e.into());
                }
                self.remove_parts();
                info!(output = %output.display(), "Audiobook assembled");
                Ok(vec![output])
            }
            OutputMode::PerChapter => {
                if let Err(e) = self.finalize_chapter().await {
                    self.discard();
                    return Err(e);
                }
                let playlist = self.chapter_dir().join(PLAYLIST_FILE);
                self.written.insert(playlist.clone());
                if let Err(e) = write_playlist(&self.chapter_files, &playlist) {
                    self.discard();
                    return Err(e.into());
                }
                self.chapter_files.push(playlist);

                let archive = self
                    .output_dir
                    .join(format!("{}_chapters.zip", self.book_stem));
                self.written.insert(archive.clone());

                let files = self.chapter_files.clone();
                let target = archive.clone();
                let bundled = tokio::task::spawn_blocking(move || write_archive(&files, &target))
                    .await
                    .map_err(|e| PipelineError::Worker(e.to_string()))
                    .and_then(|result| result);
                if let Err(e) = bundled {
                    self.discard();
                    return Err(e);
                }

                info!(
                    archive = %archive.display(),
                    chapters = self.chapter_files.len() - 1,
                    "Chapter bundle assembled"
                );
                let mut outputs = std::mem::take(&mut self.chapter_files);
                outputs.push(archive);
                Ok(outputs)
            }
        }
    }

    /// Remove every part and every output written so far.
    pub fn discard(&mut self) {
        self.remove_parts();
        for path in self.written.drain() {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Could not remove partial output");
                }
            }
        }
        self.chapter_files.clear();
        // Removed only if empty.
        let _ = fs::remove_dir(self.chapter_dir());
    }
}

/// M3U playlist of the chapter files, by file name, in chapter order.
fn write_playlist(files: &[PathBuf], playlist: &Path) -> io::Result<()> {
    if let Some(dir) = playlist.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut out = BufWriter::new(File::create(playlist)?);
    writeln!(out, "#EXTM3U")?;
    for file in files {
        if let Some(name) = file.file_name() {
            writeln!(out, "{}", name.to_string_lossy())?;
        }
    }
    out.flush()
}

fn write_archive(files: &[PathBuf], archive: &Path) -> Result<(), PipelineError> {
    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        zip.start_file(name, options)?;
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FallbackAssembler;
    use std::io::Read;

    fn assembler() -> Arc<dyn AudioAssembler> {
        Arc::new(FallbackAssembler::new(AudioFormat::Mp3, 22050))
    }

    fn part(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("What? A <Title>: Part 1/2"), "What_A_Title_Part_12");
        assert_eq!(sanitize_filename("  spaced   out  "), "spaced_out");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 100);
        assert_eq!(book_file_stem("???"), "audiobook");
    }

    #[test]
    fn chapter_stems_keep_order() {
        assert_eq!(chapter_file_stem(7, "The Storm"), "007_The_Storm");
        assert_eq!(chapter_file_stem(12, "***"), "012_chapter");
        let long = chapter_file_stem(1, &"word ".repeat(40));
        assert!(long.chars().count() <= 4 + MAX_CHAPTER_TITLE_CHARS);
        assert!(chapter_file_stem(2, "b") < chapter_file_stem(10, "a"));
    }

    #[tokio::test]
    async fn single_file_keeps_order_and_shared_parts() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let silence = part(work.path(), "_silence.mp3", b"--");
        let a = part(work.path(), "a.mp3", b"AA");
        let b = part(work.path(), "b.mp3", b"BB");

        let mut artifacts = ArtifactAssembler::new(
            assembler(),
            OutputMode::SingleFile,
            out.path(),
            "My Book",
            AudioFormat::Mp3,
        );
        artifacts.begin_chapter(1, "One").await.unwrap();
        artifacts.push_shared(silence.clone());
        artifacts.push(a.clone());
        artifacts.begin_chapter(2, "Two").await.unwrap();
        artifacts.push_shared(silence.clone());
        artifacts.push(b.clone());

        let outputs = artifacts.finish().await.unwrap();
        assert_eq!(outputs, vec![out.path().join("My_Book.mp3")]);
        assert_eq!(fs::read(&outputs[0]).unwrap(), b"--AA--BB");
        assert!(silence.exists());
        assert!(!a.exists() && !b.exists());
    }

    #[tokio::test]
    async fn per_chapter_files_are_bundled() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut artifacts = ArtifactAssembler::new(
            assembler(),
            OutputMode::PerChapter,
            out.path(),
            "Book",
            AudioFormat::Mp3,
        );
        artifacts.begin_chapter(1, "Dawn").await.unwrap();
        artifacts.push(part(work.path(), "1a", b"1a"));
        artifacts.push(part(work.path(), "1b", b"1b"));
        artifacts.begin_chapter(3, "Dusk").await.unwrap();
        artifacts.push(part(work.path(), "3a", b"3a"));

        let outputs = artifacts.finish().await.unwrap();
        let chapters = out.path().join("Book_chapters");
        assert_eq!(
            outputs,
            vec![
                chapters.join("001_Dawn.mp3"),
                chapters.join("003_Dusk.mp3"),
                chapters.join("playlist.m3u"),
                out.path().join("Book_chapters.zip"),
            ]
        );
        assert_eq!(fs::read(&outputs[0]).unwrap(), b"1a1b");
        assert_eq!(
            fs::read_to_string(&outputs[2]).unwrap(),
            "#EXTM3U\n001_Dawn.mp3\n003_Dusk.mp3\n"
        );

        let mut zip = zip::ZipArchive::new(File::open(&outputs[3]).unwrap()).unwrap();
        assert_eq!(zip.len(), 3);
        let mut content = String::new();
        zip.by_name("003_Dusk.mp3").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "3a");
    }

    #[tokio::test]
    async fn discard_removes_finished_chapters() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut artifacts = ArtifactAssembler::new(
            assembler(),
            OutputMode::PerChapter,
            out.path(),
            "Book",
            AudioFormat::Mp3,
        );
        artifacts.begin_chapter(1, "Dawn").await.unwrap();
        artifacts.push(part(work.path(), "1a", b"1a"));
        artifacts.begin_chapter(2, "Noon").await.unwrap();
        let pending = part(work.path(), "2a", b"2a");
        artifacts.push(pending.clone());
        assert!(out.path().join("Book_chapters/001_Dawn.mp3").exists());

        artifacts.discard();
        assert!(!out.path().join("Book_chapters").exists());
        assert!(!pending.exists());
    }
}
