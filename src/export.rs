//! Plain-text export of an analyzed book, for external TTS tools or review.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::artifacts::chapter_file_stem;
use crate::error::PipelineError;
use crate::model::BookInfo;
use crate::normalize::format_heading_for_speech;

/// Long pause between chapters; engines read the ellipsis as a breath.
pub const CHAPTER_PAUSE: &str = "\n\n...\n\n";
pub const MANIFEST_FILE: &str = "_manifest.json";

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub title: String,
    pub author: String,
    pub language: String,
    pub total_chapters: usize,
    pub total_words: usize,
    pub estimated_duration_minutes: f64,
    pub chapters: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub title: String,
    pub file: String,
    pub words: usize,
    pub chars: usize,
    pub estimated_minutes: f64,
}

fn one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// The whole book as one text: header, then every chapter with its spoken
/// heading, separated by chapter pauses.
pub fn render_book(book: &BookInfo) -> String {
    let mut out = format!("{}\nby {}{}", book.title, book.author, CHAPTER_PAUSE);
    for (i, chapter) in book.chapters.iter().enumerate() {
        out.push_str(&format_heading_for_speech(&chapter.title));
        out.push_str("\n\n");
        out.push_str(&chapter.text);
        if i + 1 < book.chapters.len() {
            out.push_str(CHAPTER_PAUSE);
        }
    }
    out.push_str("\n\nThe End.\n");
    out
}

pub fn write_single_file(book: &BookInfo, path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render_book(book))?;
    info!(path = %path.display(), chapters = book.chapters.len(), "Wrote text export");
    Ok(())
}

/// One numbered `.txt` per chapter plus `_manifest.json`. Returns the
/// manifest path.
pub fn write_chapter_files(book: &BookInfo, dir: &Path) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)?;

    let mut entries = Vec::with_capacity(book.chapters.len());
    for chapter in &book.chapters {
        let file = format!("{}.txt", chapter_file_stem(chapter.index, &chapter.title));
        let body = format!(
            "{}\n\n{}\n",
            format_heading_for_speech(&chapter.title),
            chapter.text
        );
        fs::write(dir.join(&file), body)?;

        entries.push(ManifestEntry {
            index: chapter.index,
            title: chapter.title.clone(),
            file,
            words: chapter.word_count,
            chars: chapter.char_count,
            estimated_minutes: one_decimal(chapter.estimated_minutes()),
        });
    }

    let manifest = Manifest {
        title: book.title.clone(),
        author: book.author.clone(),
        language: book.language.clone(),
        total_chapters: book.chapters.len(),
        total_words: book.total_words,
        estimated_duration_minutes: one_decimal(book.estimated_duration_minutes),
        chapters: entries,
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
    info!(dir = %dir.display(), chapters = manifest.total_chapters, "Wrote chapter files");
    Ok(manifest_path)
}
