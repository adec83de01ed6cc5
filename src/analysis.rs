//! First look at a document: parse it, refuse empty books, pick a preview.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::classifier::ContentClassifier;
use crate::config::Config;
use crate::error::PipelineError;
use crate::model::BookInfo;
use crate::source::parser_for;

const PREVIEW_MIN_WORDS: usize = 80;
const PREVIEW_MIN_CHARS: usize = 150;
const PREVIEW_TARGET_MIN: usize = 200;
const PREVIEW_TARGET_MAX: usize = 300;

#[derive(Debug, Clone)]
pub struct Analysis {
    pub book: BookInfo,
    /// A few sentences of narrative for a voice preview; may be empty.
    pub preview: String,
}

/// Parse a document into a [`BookInfo`] ready for synthesis.
pub fn analyze(path: &Path, config: &Config) -> Result<Analysis, PipelineError> {
    let book = parser_for(path, config).parse(path)?;
    if book.chapters.is_empty() {
        return Err(PipelineError::NoContent);
    }

    let is_text = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("txt"))
        .unwrap_or(false);
    let classifier = ContentClassifier::new(config.classifier.clone());
    let preview = pick_preview_text(&book, &classifier, is_text)
        .map(|text| trim_preview(&text))
        .unwrap_or_default();

    info!(
        book = %book.title,
        chapters = book.chapters.len(),
        words = book.total_words,
        minutes = book.estimated_duration_minutes.round(),
        "Analyzed document"
    );
    Ok(Analysis { book, preview })
}

/// Text to preview a voice with. Front matter usually comes first, so for
/// packaged books the second real chapter is preferred.
pub fn pick_preview_text(book: &BookInfo, classifier: &ContentClassifier, plain_text: bool) -> Option<String> {
    let first_long = || {
        book.chapters
            .iter()
            .map(|c| c.text.trim())
            .find(|t| t.chars().count() >= PREVIEW_MIN_CHARS)
            .map(str::to_string)
    };
    if plain_text {
        return first_long();
    }

    let narrative: Vec<_> = book
        .chapters
        .iter()
        .filter(|c| c.word_count >= PREVIEW_MIN_WORDS && classifier.is_content_chapter(&c.text, &c.title))
        .collect();
    match narrative.as_slice() {
        [] => first_long(),
        [only] => Some(only.text.trim().to_string()),
        [_, second, ..] => Some(second.text.trim().to_string()),
    }
}

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[.!?]["“”»)\s]"#).unwrap())
}

/// Cut to 200-300 characters, at a sentence end if one falls in that window,
/// otherwise at the last space.
pub fn trim_preview(text: &str) -> String {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= PREVIEW_TARGET_MAX {
        return text;
    }

    let window: String = chars[PREVIEW_TARGET_MIN..PREVIEW_TARGET_MAX].iter().collect();
    let cut = match sentence_end().find(&window) {
        Some(m) => PREVIEW_TARGET_MIN + window[..m.start()].chars().count() + 1,
        None => chars[PREVIEW_TARGET_MIN..PREVIEW_TARGET_MAX]
            .iter()
            .rposition(|c| *c == ' ')
            .map(|p| PREVIEW_TARGET_MIN + p)
            .filter(|p| *p > 0)
            .unwrap_or(PREVIEW_TARGET_MAX),
    };
    chars[..cut].iter().collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Chapter;

    fn prose(words: usize, tag: &str) -> String {
        (0..words)
            .map(|i| if i % 12 == 11 { format!("{}{}.", tag, i) } else { format!("{}{}", tag, i) })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn preview_skips_to_second_narrative_chapter() {
        let book = BookInfo::new(
            "Book",
            "Author",
            vec![
                Chapter::new(1, "Copyright", prose(100, "c"), "a"),
                Chapter::new(2, "Prologue", prose(100, "p"), "b"),
                Chapter::new(3, "The Road", prose(100, "r"), "c"),
            ],
        );
        let preview = pick_preview_text(&book, &ContentClassifier::default(), false).unwrap();
        assert!(preview.starts_with("r0 r1"));
    }

    #[test]
    fn plain_text_uses_first_long_chapter() {
        let book = BookInfo::new("T", "U", vec![Chapter::new(1, "T", prose(60, "w"), "t.txt")]);
        let preview = pick_preview_text(&book, &ContentClassifier::default(), true).unwrap();
        assert!(preview.starts_with("w0"));

        let short = BookInfo::new("T", "U", vec![Chapter::new(1, "T", "Too short.", "t.txt")]);
        assert!(pick_preview_text(&short, &ContentClassifier::default(), true).is_none());
    }

    #[test]
    fn preview_is_cut_at_sentence_end() {
        let sentence = "This is a sentence of moderate length for testing. ";
        let text = sentence.repeat(10);
        let preview = trim_preview(&text);
        let len = preview.chars().count();
        assert!((200..=300).contains(&len), "{}", len);
        assert!(preview.ends_with('.'));
    }

    #[test]
    fn preview_without_sentence_end_cuts_at_space() {
        let text = "word ".repeat(100);
        let preview = trim_preview(&text);
        assert!(preview.chars().count() <= 300);
        assert!(preview.ends_with("word"));
    }

    #[test]
    fn short_text_is_only_collapsed() {
        assert_eq!(trim_preview("  a\n\nb  c "), "a b c");
    }

    #[test]
    fn analyze_rejects_empty_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "").unwrap();
        assert!(analyze(&path, &Config::default()).is_err());
    }

    #[test]
    fn analyze_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fable.txt");
        std::fs::write(&path, prose(120, "f")).unwrap();
        let analysis = analyze(&path, &Config::default()).unwrap();
        assert_eq!(analysis.book.chapters.len(), 1);
        assert!(!analysis.preview.is_empty());
        assert!(analysis.preview.chars().count() <= 300);
    }
}
