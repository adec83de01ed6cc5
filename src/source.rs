//! Book readers. Every supported input format produces the same [`BookInfo`].

use epub::doc::{EpubDoc, NavPoint};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::markup;
use crate::model::{BookInfo, Chapter};
use crate::normalize::TextNormalizer;
use crate::segmenter::{ChapterSegmenter, Fragment, PackagedDocument, TocEntry};

const UNKNOWN_AUTHOR: &str = "Unknown";

pub trait BookParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<BookInfo, PipelineError>;
}

/// Parser for a file, picked by extension (`.txt` is plain text, anything
/// else is treated as EPUB).
pub fn parser_for(path: &Path, config: &Config) -> Box<dyn BookParser> {
    let is_text = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("txt"))
        .unwrap_or(false);
    if is_text {
        Box::new(PlainTextParser::new(config))
    } else {
        Box::new(EpubParser::new(config))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub struct EpubParser {
    segmenter: ChapterSegmenter,
}

impl EpubParser {
    pub fn new(config: &Config) -> Self {
        Self {
            segmenter: ChapterSegmenter::new(config),
        }
    }

    /// Reading-order fragments, TOC and metadata of an EPUB file.
    pub fn load_package(&self, path: &Path) -> Result<PackagedDocument, PipelineError> {
        let mut doc = EpubDoc::new(path)
            .map_err(|e| PipelineError::Parse(format!("{}: {}", path.display(), e)))?;

        let meta = |doc: &EpubDoc<_>, key: &str| {
            doc.mdata(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let title = meta(&doc, "title").unwrap_or_else(|| file_stem(path));
        let author = meta(&doc, "creator").unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
        let language = meta(&doc, "language").unwrap_or_default();
        let publisher = meta(&doc, "publisher").unwrap_or_default();
        let description = meta(&doc, "description").unwrap_or_default();

        let toc = doc.toc.iter().map(toc_entry).collect();
        let root_file = doc.root_file.clone();
        let properties = doc
            .get_resource_str_by_path(&root_file)
            .map(|opf| declared_properties(&opf))
            .unwrap_or_default();

        let mut fragments = Vec::new();
        for page in 0..doc.get_num_pages() {
            if !doc.set_current_page(page) {
                continue;
            }
            let fragment_path = doc
                .get_current_path()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|| format!("page-{}", page));
            let Some((bytes, mime)) = doc.get_current() else {
                warn!(fragment = %fragment_path, "Spine item could not be read, skipping");
                continue;
            };
            if !mime.contains("html") && !mime.contains("xml") {
                debug!(fragment = %fragment_path, %mime, "Skipping non-markup spine item");
                continue;
            }
            let declared = doc
                .get_current_id()
                .and_then(|id| properties.get(&id).cloned())
                .unwrap_or_default();
            fragments.push(
                Fragment::new(fragment_path, String::from_utf8_lossy(&bytes).into_owned())
                    .with_properties(declared),
            );
        }

        if fragments.is_empty() {
            return Err(PipelineError::Parse(format!(
                "{}: no readable documents in the spine",
                path.display()
            )));
        }

        Ok(PackagedDocument {
            title,
            author,
            language,
            publisher,
            description,
            fragments,
            toc,
        })
    }
}

/// `properties` declared in the package file, per manifest id. Values of the
/// manifest `item` and of its spine `itemref` are merged.
pub fn declared_properties(opf: &str) -> HashMap<String, Vec<String>> {
    let root = markup::parse(opf);
    let mut declared: HashMap<String, Vec<String>> = HashMap::new();
    for (tag, id_attr) in [("item", "id"), ("itemref", "idref")] {
        for el in root.find_all(tag) {
            let (Some(id), Some(value)) = (el.attr(id_attr), el.attr("properties")) else {
                continue;
            };
            declared
                .entry(id.to_string())
                .or_default()
                .extend(value.split_whitespace().map(str::to_lowercase));
        }
    }
    declared
}

fn toc_entry(point: &NavPoint) -> TocEntry {
    TocEntry {
        title: point.label.trim().to_string(),
        target: point.content.to_string_lossy().replace('\\', "/"),
        children: point.children.iter().map(toc_entry).collect(),
    }
}

impl BookParser for EpubParser {
    fn parse(&self, path: &Path) -> Result<BookInfo, PipelineError> {
        let package = self.load_package(path)?;
        let fragments = package.fragments.len();
        let chapters = self.segmenter.segment(&package);
        info!(
            book = %package.title,
            fragments,
            chapters = chapters.len(),
            "Parsed EPUB"
        );

        let mut book = BookInfo::new(package.title, package.author, chapters)
            .with_language(package.language);
        book.publisher = package.publisher;
        book.description = package.description;
        Ok(book)
    }
}

/// One-chapter books from plain text files.
pub struct PlainTextParser {
    normalizer: TextNormalizer,
}

impl PlainTextParser {
    pub fn new(config: &Config) -> Self {
        Self {
            normalizer: TextNormalizer::from_config(config),
        }
    }
}

/// UTF-8 (byte-order mark dropped) or, failing that, Latin-1.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

impl BookParser for PlainTextParser {
    fn parse(&self, path: &Path) -> Result<BookInfo, PipelineError> {
        let raw = decode_text(&fs::read(path)?);
        if raw.trim().is_empty() {
            return Err(PipelineError::EmptyText);
        }
        let text = self.normalizer.normalize(&raw);
        if text.is_empty() {
            return Err(PipelineError::EmptyText);
        }

        let title = file_stem(path).replace(['_', '-'], " ").trim().to_string();
        let title = if title.is_empty() { "Text".to_string() } else { title };
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let chapter = Chapter::new(1, title.clone(), text, source);
        Ok(BookInfo::new(title, UNKNOWN_AUTHOR, vec![chapter]))
    }
}
