//! Narrative-vs-apparatus decision for extracted text blocks.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::config::ClassifierThresholds;
use crate::markup::contains_keyword;

/// Titles of front/back matter, lowercase, several languages.
const NON_CONTENT_TITLES: &[&str] = &[
    // table of contents
    "indice", "indice generale", "indice dei contenuti", "sommario", "table of contents",
    "contents", "toc", "table des matières", "sommaire", "índice", "índice general",
    "inhaltsverzeichnis", "inhalt",
    // copyright and colophon
    "copyright", "colophon", "note legali", "informazioni legali", "avviso legale",
    "legal notice", "all rights reserved", "copyright notice", "mentions légales",
    "aviso legal", "impressum",
    // cover and title page
    "frontespizio", "title page", "cover", "copertina", "half title", "halftitle",
    "page de titre",
    // dedication and epigraph
    "dedica", "dedication", "dédicace", "dedicatoria", "epigrafe", "epigraph", "épigraphe",
    // bibliography
    "bibliografia", "bibliography", "bibliographie", "bibliografía",
    "riferimenti bibliografici", "riferimenti", "references", "opere citate", "works cited",
    "fonti", "sources", "letture consigliate", "further reading", "suggested reading",
    "per approfondire", "lectures complémentaires",
    // notes
    "note", "notes", "note al testo", "note a piè di pagina", "note finali", "endnotes",
    "footnotes", "anmerkungen", "note dell'autore", "note del traduttore",
    "note del curatore", "note bibliografiche", "note critiche",
    // glossary
    "glossario", "glossary", "glossaire", "glosario", "glossar",
    // analytic index
    "indice analitico", "indice dei nomi", "indice dei luoghi", "indice delle opere",
    "indice tematico", "index", "name index", "subject index", "word index",
    // appendix
    "appendice", "appendix", "annexe", "apéndice", "anhang",
    // about the author
    "about the author", "sull'autore", "l'autore", "l'autrice", "biography", "biografia",
    "biographie", "about the translator", "nota del traduttore", "dello stesso autore",
    "also by", "du même auteur", "altre opere", "other books",
    // acknowledgements
    "ringraziamenti", "acknowledgements", "acknowledgments", "remerciements",
    "agradecimientos", "danksagung",
    // errata and credits
    "errata", "errata corrige", "credits", "crediti", "photo credits", "image credits",
    "illustration credits",
];

const COLOPHON_SIGNALS: &[&str] = &[
    "tutti i diritti", "all rights reserved", "tous droits", "prima edizione",
    "first published", "printed in", "stampato in", "finito di stampare", "tipografia",
    "isbn", "© ", "propriet", "vietata la riproduzione",
];

/// Why a block was not considered narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    TooFewWords,
    TitleKeyword(&'static str),
    ShortLines,
    PageReferences,
    Bibliography,
    Colophon,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooShort => write!(f, "too short"),
            Rejection::TooFewWords => write!(f, "too few words"),
            Rejection::TitleKeyword(keyword) => write!(f, "title matches '{}'", keyword),
            Rejection::ShortLines => write!(f, "mostly short lines"),
            Rejection::PageReferences => write!(f, "page-number density"),
            Rejection::Bibliography => write!(f, "bibliography density"),
            Rejection::Colophon => write!(f, "colophon signals"),
        }
    }
}

fn page_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,4}\s*$|\.\s*\.\s*\.\s*\d").unwrap())
}

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap())
}

fn separator_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[,;]\s").unwrap())
}

/// Pure heuristic filter: the same `(text, title)` always gets the same answer.
#[derive(Debug, Clone, Default)]
pub struct ContentClassifier {
    thresholds: ClassifierThresholds,
}

impl ContentClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn is_content_chapter(&self, text: &str, title: &str) -> bool {
        self.classify(text, title).is_ok()
    }

    pub fn classify(&self, text: &str, title: &str) -> Result<(), Rejection> {
        let t = &self.thresholds;
        let clean = text.trim();

        if clean.chars().count() < t.min_chars {
            return Err(Rejection::TooShort);
        }
        if clean.split_whitespace().count() < t.min_words {
            return Err(Rejection::TooFewWords);
        }
        if let Some(keyword) = non_content_title(title) {
            return Err(Rejection::TitleKeyword(keyword));
        }

        let lines: Vec<&str> = clean
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let n_lines = lines.len();
        let ratio = |count: usize| count as f64 / n_lines as f64;

        let short = lines
            .iter()
            .filter(|l| l.chars().count() < t.short_line_chars)
            .count();
        if n_lines > t.short_line_min_lines && ratio(short) > t.short_line_ratio {
            return Err(Rejection::ShortLines);
        }

        if n_lines > t.density_min_lines {
            let page_refs = lines.iter().filter(|l| page_ref_regex().is_match(l)).count();
            if ratio(page_refs) > t.page_ref_ratio {
                return Err(Rejection::PageReferences);
            }

            let bib = lines
                .iter()
                .filter(|l| {
                    year_regex().is_match(l)
                        && separator_regex().is_match(l)
                        && l.chars().count() > t.bibliography_min_line_chars
                })
                .count();
            if ratio(bib) > t.bibliography_ratio {
                return Err(Rejection::Bibliography);
            }
        }

        let head: String = clean
            .chars()
            .take(t.colophon_window_chars)
            .collect::<String>()
            .to_lowercase();
        let signals = COLOPHON_SIGNALS.iter().filter(|s| head.contains(*s)).count();
        if signals >= t.colophon_min_signals {
            return Err(Rejection::Colophon);
        }

        Ok(())
    }
}

/// The front/back-matter keyword a title contains, if any.
///
/// Keywords must stand as whole words, so "Discovery" is not a "cover".
pub fn non_content_title(title: &str) -> Option<&'static str> {
    let lower = title.to_lowercase();
    if lower.trim().is_empty() {
        return None;
    }
    NON_CONTENT_TITLES
        .iter()
        .copied()
        .find(|keyword| contains_keyword(&lower, keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prose(words: usize) -> String {
        let sentence = "The river ran quietly past the old mill and into the valley below. ";
        let mut text = String::new();
        while text.split_whitespace().count() < words {
            text.push_str(sentence);
        }
        text
    }

    #[test]
    fn accepts_narrative_and_rejects_bibliography_title() {
        let classifier = ContentClassifier::default();
        let body = prose(60);
        assert!(classifier.is_content_chapter(&body, "Chapter 1"));
        assert_eq!(
            classifier.classify(&body, "Bibliography"),
            Err(Rejection::TitleKeyword("bibliography"))
        );
    }

    #[test]
    fn rejects_short_blocks() {
        let classifier = ContentClassifier::default();
        assert_eq!(classifier.classify("Too short.", "One"), Err(Rejection::TooShort));
        let padded = format!("{} word", "x".repeat(120));
        assert_eq!(classifier.classify(&padded, "One"), Err(Rejection::TooFewWords));
    }

    #[test]
    fn title_keywords_need_word_boundaries() {
        assert_eq!(non_content_title("Discovery"), None);
        assert_eq!(non_content_title("Footnotes"), Some("footnotes"));
        assert_eq!(non_content_title("Table des matières"), Some("table des matières"));
        assert_eq!(non_content_title(""), None);
    }

    #[test]
    fn rejects_index_like_listings() {
        let listing: String = (0..40).map(|i| format!("entry {}\n", i)).collect();
        let listing = format!("{}{}", listing, prose(30));
        assert_eq!(
            ContentClassifier::default().classify(&listing, "Part Two"),
            Err(Rejection::ShortLines)
        );
    }

    #[test]
    fn rejects_toc_like_page_references() {
        let toc: String = (1..=12)
            .map(|i| format!("The long journey of the little boat number {} . . . {}\n", i, i * 10))
            .collect();
        assert_eq!(
            ContentClassifier::default().classify(&toc, "Untitled"),
            Err(Rejection::PageReferences)
        );
    }

    #[test]
    fn rejects_bibliography_like_content() {
        let bib: String = (0..10)
            .map(|i| format!("Smith, John; Doe, Jane. A study of rivers, volume {}, Oxford 19{} edition.\n", i, 50 + i))
            .collect();
        assert_eq!(
            ContentClassifier::default().classify(&bib, "Readings"),
            Err(Rejection::Bibliography)
        );
    }

    #[test]
    fn rejects_colophon() {
        let text = format!("First published in 1999. All rights reserved. {}", prose(40));
        assert_eq!(
            ContentClassifier::default().classify(&text, "Imprint page"),
            Err(Rejection::Colophon)
        );
    }

    #[test]
    fn classification_is_repeatable() {
        let classifier = ContentClassifier::default();
        let body = prose(45);
        let first = classifier.classify(&body, "Chapter 7");
        for _ in 0..3 {
            assert_eq!(classifier.classify(&body, "Chapter 7"), first);
        }
    }

    #[test]
    fn thresholds_are_configurable() {
        let lenient = ContentClassifier::new(ClassifierThresholds {
            min_chars: 5,
            min_words: 2,
            ..ClassifierThresholds::default()
        });
        assert!(lenient.is_content_chapter("Short but fine.", "Prologue"));
    }
}
