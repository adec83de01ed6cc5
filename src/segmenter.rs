//! Ordered chapter list from a packaged document.
//!
//! A packaged document is a reading-order list of markup fragments plus a
//! nested table of contents. Fragments are analysed in parallel; chapter
//! indices are handed out afterwards in reading order, and only to sections
//! that pass the content classifier.

use rayon::prelude::*;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::classifier::ContentClassifier;
use crate::config::{Config, HeadingMatchConfig};
use crate::markup::{self, Element, MarkupExtractor, NON_NARRATIVE_EPUB_TYPES};
use crate::model::Chapter;
use crate::normalize::TextNormalizer;

/// File stems (lowercase, `-`/`_` removed) that never hold narrative.
const NON_CONTENT_STEMS_EXACT: &[&str] = &[
    "toc", "nav", "contents", "cover", "colophon", "copyright", "titlepage", "halftitle",
    "frontmatter", "backmatter", "landmarks", "dedication", "epigraph", "notes", "endnotes",
    "footnotes", "biblio", "bibliography", "references", "glossary",
];

/// Longer, unambiguous stem fragments.
const NON_CONTENT_STEMS_SUBSTR: &[&str] = &[
    "bibliography", "footnotes", "endnotes", "glossary", "colophon", "frontmatter",
    "backmatter", "tableofcontents",
];

const TYPE_SCAN_CHARS: usize = 2000;
const DETECTED_TITLE_MAX_CHARS: usize = 200;
const FALLBACK_TITLE_TRUNCATE_CHARS: usize = 100;

/// One source document unit in reading order.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    pub path: String,
    pub html: String,
    /// Semantic properties the package declares for this item.
    pub properties: Vec<String>,
}

impl Fragment {
    pub fn new(path: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            html: html.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = properties;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TocEntry {
    pub title: String,
    /// Fragment path, optionally followed by `#anchor`.
    pub target: String,
    pub children: Vec<TocEntry>,
}

impl TocEntry {
    pub fn new(title: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            target: target.into(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PackagedDocument {
    pub title: String,
    pub author: String,
    pub language: String,
    pub publisher: String,
    pub description: String,
    pub fragments: Vec<Fragment>,
    pub toc: Vec<TocEntry>,
}

/// Canonical fragment key: anchor dropped, `.`/`..` resolved, `/` separators.
pub fn normalize_target(target: &str) -> String {
    let path = target.split('#').next().unwrap_or("").replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Flattened table of contents keyed by fragment.
#[derive(Debug, Default)]
struct TocIndex {
    titles: HashMap<String, String>,
    multi: HashMap<String, Vec<String>>,
}

impl TocIndex {
    fn build(entries: &[TocEntry]) -> Self {
        fn walk(entries: &[TocEntry], titles: &mut HashMap<String, String>, all: &mut Vec<(String, String)>) {
            for entry in entries {
                let key = normalize_target(&entry.target);
                let title = entry.title.split_whitespace().collect::<Vec<_>>().join(" ");
                if !key.is_empty() && !title.is_empty() {
                    titles.entry(key.clone()).or_insert_with(|| title.clone());
                    all.push((key, title));
                }
                walk(&entry.children, titles, all);
            }
        }

        let mut titles = HashMap::new();
        let mut all = Vec::new();
        walk(entries, &mut titles, &mut all);

        let mut multi: HashMap<String, Vec<String>> = HashMap::new();
        for (key, title) in all {
            let list = multi.entry(key).or_default();
            if !list.contains(&title) {
                list.push(title);
            }
        }
        multi.retain(|_, list| list.len() >= 2);

        Self { titles, multi }
    }

    fn title(&self, path: &str) -> Option<&String> {
        lookup(&self.titles, path)
    }

    fn multi(&self, path: &str) -> Option<&Vec<String>> {
        lookup(&self.multi, path)
    }
}

/// Exact key first, then a key that is a path suffix of the fragment (or the
/// other way round) since TOC targets and fragment paths may differ in root.
fn lookup<'a, V>(map: &'a HashMap<String, V>, path: &str) -> Option<&'a V> {
    let key = normalize_target(path);
    if let Some(value) = map.get(&key) {
        return Some(value);
    }
    // Longest matching key wins; ties go to the lexically smallest key.
    map.iter()
        .filter(|(candidate, _)| {
            key.ends_with(&format!("/{}", candidate)) || candidate.ends_with(&format!("/{}", key))
        })
        .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
        .map(|(_, value)| value)
}

/// Why a whole fragment is left out, if it is.
pub fn fragment_skip_reason(fragment: &Fragment) -> Option<&'static str> {
    let stem = Path::new(&normalize_target(&fragment.path))
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase().replace(['-', '_'], ""))
        .unwrap_or_default();

    if NON_CONTENT_STEMS_EXACT.contains(&stem.as_str()) {
        return Some("non-content file name");
    }
    if NON_CONTENT_STEMS_SUBSTR.iter().any(|s| stem.contains(s)) {
        return Some("non-content file name");
    }

    if fragment.properties.iter().any(|p| markup::epub_type_matches(p)) {
        return Some("non-narrative spine properties");
    }

    let head: String = fragment
        .html
        .chars()
        .take(TYPE_SCAN_CHARS)
        .collect::<String>()
        .to_lowercase();
    let declared = NON_NARRATIVE_EPUB_TYPES.iter().any(|t| {
        [
            format!("epub:type=\"{}\"", t),
            format!("epub:type='{}'", t),
            format!("epub:type=\"{} ", t),
            format!("epub:type='{} ", t),
        ]
        .iter()
        .any(|needle| head.contains(needle.as_str()))
    });
    declared.then_some("non-narrative semantic type")
}

/// Lowercase, punctuation removed, whitespace collapsed.
fn match_key(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

struct Section {
    title: Option<String>,
    text: String,
}

pub struct ChapterSegmenter {
    extractor: MarkupExtractor,
    normalizer: TextNormalizer,
    classifier: ContentClassifier,
    matching: HeadingMatchConfig,
}

impl ChapterSegmenter {
    pub fn new(config: &Config) -> Self {
        Self {
            extractor: MarkupExtractor::new(),
            normalizer: TextNormalizer::from_config(config),
            classifier: ContentClassifier::new(config.classifier.clone()),
            matching: config.matching.clone(),
        }
    }

    pub fn segment(&self, doc: &PackagedDocument) -> Vec<Chapter> {
        let toc = TocIndex::build(&doc.toc);

        let analysed: Vec<Vec<Section>> = doc
            .fragments
            .par_iter()
            .map(|fragment| self.analyse_fragment(fragment, &toc))
            .collect();

        let mut chapters = Vec::new();
        for (fragment, sections) in doc.fragments.iter().zip(analysed) {
            for section in sections {
                let index = chapters.len() + 1;
                let title = section
                    .title
                    .unwrap_or_else(|| format!("Section {}", index));
                chapters.push(Chapter::new(index, title, section.text, fragment.path.clone()));
            }
        }
        chapters
    }

    fn analyse_fragment(&self, fragment: &Fragment, toc: &TocIndex) -> Vec<Section> {
        if let Some(reason) = fragment_skip_reason(fragment) {
            debug!(fragment = %fragment.path, reason, "Skipping fragment");
            return Vec::new();
        }

        let dom = markup::parse(&fragment.html);

        if let Some(titles) = toc.multi(&fragment.path) {
            if let Some(parts) = self.split_by_headings(&fragment.html, &dom, titles) {
                debug!(fragment = %fragment.path, sections = parts.len(), "Splitting multi-chapter fragment");
                return parts
                    .into_iter()
                    .filter_map(|(title, html)| {
                        let text = self.normalizer.normalize(&self.extractor.extract(html));
                        self.accept(&fragment.path, Some(title), text)
                    })
                    .collect();
            }
        }

        let title = toc
            .title(&fragment.path)
            .cloned()
            .or_else(|| self.detect_title(&dom));
        let text = self
            .normalizer
            .normalize(&self.extractor.extract_parsed(&fragment.html, &dom));
        self.accept(&fragment.path, title, text).into_iter().collect()
    }

    fn accept(&self, path: &str, title: Option<String>, text: String) -> Option<Section> {
        let label = title.as_deref().unwrap_or("");
        if let Err(reason) = self.classifier.classify(&text, label) {
            debug!(fragment = %path, title = label, %reason, "Rejected as non-content");
            return None;
        }
        let text = match &title {
            Some(title) => strip_leading_title(&text, title),
            None => text,
        };
        Some(Section { title, text })
    }

    /// First `h1`, `h2` or `h3`, then `<title>`.
    fn detect_title(&self, dom: &Element) -> Option<String> {
        for level in ["h1", "h2", "h3"] {
            if let Some(heading) = dom.find_first(level) {
                let text = self.extractor.element_text(heading);
                if !text.is_empty() && text.chars().count() < DETECTED_TITLE_MAX_CHARS {
                    return Some(text);
                }
            }
        }
        dom.find_first("title")
            .map(|el| el.text())
            .filter(|t| {
                !t.is_empty()
                    && t.chars().count() < DETECTED_TITLE_MAX_CHARS
                    && !t.eq_ignore_ascii_case("untitled")
            })
    }

    /// Split points with their titles, or `None` when the fragment should be
    /// treated as a single chapter.
    fn split_by_headings<'h>(
        &self,
        html: &'h str,
        dom: &Element,
        titles: &[String],
    ) -> Option<Vec<(String, &'h str)>> {
        let headings = markup::headings(dom);
        if headings.is_empty() {
            return None;
        }

        let toc_keys: Vec<String> = titles.iter().map(|t| match_key(t)).collect();
        let mut splits: Vec<(&Element, String)> = headings
            .iter()
            .filter_map(|heading| {
                let text = self.extractor.element_text(heading);
                self.match_toc(&text, &toc_keys)
                    .map(|i| (*heading, titles[i].clone()))
            })
            .collect();

        if splits.is_empty() {
            splits = self.dominant_level_splits(&headings);
        }
        if splits.len() < 2 {
            return None;
        }

        let sections: Vec<(String, &str)> = splits
            .iter()
            .enumerate()
            .filter_map(|(i, (heading, title))| {
                let start = heading.end;
                let end = splits.get(i + 1).map(|(next, _)| next.start).unwrap_or(html.len());
                let body = html.get(start..end)?;
                (!body.trim().is_empty()).then(|| (title.clone(), body))
            })
            .collect();

        (!sections.is_empty()).then_some(sections)
    }

    /// Index of the TOC title a heading refers to.
    fn match_toc(&self, heading: &str, toc_keys: &[String]) -> Option<usize> {
        let key = match_key(heading);
        if key.chars().count() < self.matching.min_heading_chars {
            return None;
        }

        if let Some(i) = toc_keys.iter().position(|t| *t == key) {
            return Some(i);
        }
        if let Some(i) = toc_keys
            .iter()
            .position(|t| !t.is_empty() && (t.contains(&key) || key.contains(t.as_str())))
        {
            return Some(i);
        }

        let heading_words: HashSet<&str> = key.split_whitespace().collect();
        toc_keys.iter().position(|t| {
            let toc_words: HashSet<&str> = t.split_whitespace().collect();
            if toc_words.len() < self.matching.overlap_min_toc_words {
                return false;
            }
            let shared = toc_words.intersection(&heading_words).count();
            shared as f64 / toc_words.len() as f64 >= self.matching.word_overlap_ratio
        })
    }

    /// Headings of the most frequent level (first seen wins ties).
    fn dominant_level_splits<'a>(&self, headings: &[&'a Element]) -> Vec<(&'a Element, String)> {
        let mut counts: Vec<(u8, usize)> = Vec::new();
        for level in headings.iter().filter_map(|h| h.heading_level()) {
            match counts.iter_mut().find(|(l, _)| *l == level) {
                Some((_, count)) => *count += 1,
                None => counts.push((level, 1)),
            }
        }
        let Some(best) = counts
            .iter()
            .fold(None::<(u8, usize)>, |best, &(level, count)| match best {
                Some((_, top)) if top >= count => best,
                _ => Some((level, count)),
            })
            .map(|(level, _)| level)
        else {
            return Vec::new();
        };

        let level_headings: Vec<&Element> = headings
            .iter()
            .copied()
            .filter(|h| h.heading_level() == Some(best))
            .collect();
        if level_headings.len() < 2 {
            return Vec::new();
        }

        level_headings
            .into_iter()
            .map(|heading| {
                let text = self.extractor.element_text(heading);
                let title = if text.chars().count() < self.matching.max_fallback_title_chars {
                    text
                } else {
                    text.chars().take(FALLBACK_TITLE_TRUNCATE_CHARS).collect()
                };
                (heading, title)
            })
            .collect()
    }
}

/// Drop the title once from the start of the body so it is not read twice.
fn strip_leading_title(text: &str, title: &str) -> String {
    let core = title.trim().trim_end_matches('.');
    if core.is_empty() {
        return text.to_string();
    }
    let pattern = format!(r"(?i)^\s*{}\.?\s*\n+", regex::escape(core));
    match Regex::new(&pattern) {
        Ok(re) => re.replacen(text, 1, "").trim().to_string(),
        Err(_) => text.to_string(),
    }
}
