//! Speech-oriented text cleanup.
//!
//! Turns extracted text into prose a speech engine reads naturally: no
//! typographic glyphs, no markdown leftovers, no footnote call-outs, expanded
//! abbreviations, tidy whitespace and a terminal full stop.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;

const REPLACEMENTS: &[(&str, &str)] = &[
    ("\u{00a0}", " "),
    ("\u{200b}", ""),
    ("\u{200c}", ""),
    ("\u{200d}", ""),
    ("\u{2060}", ""),
    ("\u{feff}", ""),
    ("\u{2013}", " - "),
    ("\u{2014}", " - "),
    ("\u{2018}", "'"),
    ("\u{2019}", "'"),
    ("\u{201c}", "\""),
    ("\u{201d}", "\""),
    ("\u{2026}", "..."),
    ("\u{00ab}", "\""),
    ("\u{00bb}", "\""),
    ("\u{2022}", ""),
    ("\u{25cf}", ""),
    ("\u{25cb}", ""),
    ("\u{25a0}", ""),
    ("\u{25a1}", ""),
    ("\u{25aa}", ""),
    ("\u{25ab}", ""),
    ("\u{25b6}", ""),
    ("\u{25c0}", ""),
    ("\u{2023}", ""),
    ("\u{2043}", ""),
    ("\u{204b}", ""),
    ("\u{2020}", ""),
    ("\u{2021}", ""),
    ("\u{00a7}", ""),
    ("\u{00b6}", ""),
    ("\u{00b0}", " degrees "),
    ("\u{00b9}", ""),
    ("\u{00b2}", ""),
    ("\u{00b3}", ""),
    ("\u{2070}", ""),
    ("\u{2074}", ""),
    ("\u{2075}", ""),
    ("\u{2076}", ""),
    ("\u{2077}", ""),
    ("\u{2078}", ""),
    ("\u{2079}", ""),
];

/// Built-in abbreviation dictionary.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("e.g.", "for example"),
    ("i.e.", "that is"),
    ("etc.", "et cetera"),
    ("vs.", "versus"),
    ("cf.", "compare"),
    ("approx.", "approximately"),
    ("fig.", "figure"),
    ("figs.", "figures"),
    ("vol.", "volume"),
    ("vols.", "volumes"),
    ("ed.", "edition"),
    ("op. cit.", "in the work cited"),
    ("ibid.", "ibidem"),
    ("Dr.", "Doctor"),
    ("Mr.", "Mister"),
    ("Mrs.", "Missis"),
    ("Ms.", "Miss"),
    ("Prof.", "Professor"),
    ("St.", "Saint"),
    ("Jr.", "Junior"),
    ("Sr.", "Senior"),
    ("Capt.", "Captain"),
    ("Lt.", "Lieutenant"),
    ("Col.", "Colonel"),
    ("Gen.", "General"),
    ("Rev.", "Reverend"),
];

/// Whole lines that are pure noise.
const LINE_SKIP_PATTERNS: &[&str] = &[
    r"^\s*\d{1,4}\s*$",
    r"^\s*[*\u{2022}\u{25CF}]{1,5}\s*$",
    r"^\s*[-*_=~#]{3,}\s*$",
    r"^\s*#{1,6}\s*$",
];

/// In-line noise removed wherever it occurs.
const NOISE_PATTERNS: &[(&str, &str)] = &[
    (r"\[\d+\]", ""),
    (r"\{\d+\}", ""),
    (r"\[[a-z]\]", ""),
    (r"[\u{00b9}\u{00b2}\u{00b3}\u{2070}-\u{2079}]+", ""),
    (r"[\u{2020}\u{2021}\u{00a7}\u{00b6}]", ""),
    (r"^\s*#{1,6}\s+", ""),
    (r"#{2,}", ""),
    (r"https?://\S+", ""),
    (r"\S+@\S+\.\S+", ""),
    (r"(?i)ISBN[\s:-]*[\d-]{10,}", ""),
    (r"(?i)doi[\s:]*10\.\S+", ""),
    (r"\bp+\.\s*\d[\d\s,\-\u{2013}\u{2014}]*\d", ""),
    (r"\((?:[Ss]ee|[Cc]fr\.?|[Cc]onfronta|[Vv]edi)\s+[^)]*\)", ""),
    (r"\[\s*\]", ""),
    (r"\(\s*\)", ""),
    (r"\|", " "),
];

fn compile(patterns: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    patterns
        .iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), *replacement))
        .collect()
}

fn line_skip_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        LINE_SKIP_PATTERNS
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn noise_patterns() -> &'static [(Regex, &'static str)] {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| compile(NOISE_PATTERNS))
}

fn markdown_patterns() -> &'static [(Regex, &'static str)] {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        compile(&[
            (r"(?m)^#{1,6}[ \t]*", ""),
            (r"\*{1,3}(\S)", "$1"),
            (r"(\S)\*{1,3}", "$1"),
            (r"_{2,}", ""),
            (r"~{2,}", ""),
            (r"`+", ""),
            (r"\|", " "),
            (r"<[^>]+>", ""),
            (r"&\w+;", ""),
            (r"&#\d+;", ""),
        ])
    })
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

/// Replace matches of `re` that are not glued to word characters.
fn replace_isolated(text: &str, re: &Regex, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in re.find_iter(text) {
        let before = text[..m.start()].chars().next_back();
        let after = text[m.end()..].chars().next();
        let is_word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
        if is_word(before) || is_word(after) {
            continue;
        }
        out.push_str(&text[last..m.start()]);
        out.push_str(replacement);
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Cleans raw extracted text for narration.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    /// Longest abbreviation first.
    abbreviations: Vec<(Regex, String)>,
    expand_abbreviations: bool,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(true, &BTreeMap::new())
    }
}

impl TextNormalizer {
    pub fn new(expand_abbreviations: bool, extra: &BTreeMap<String, String>) -> Self {
        let mut dictionary: BTreeMap<String, String> = ABBREVIATIONS
            .iter()
            .map(|(abbr, expansion)| (abbr.to_string(), expansion.to_string()))
            .collect();
        dictionary.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut entries: Vec<(String, String)> = dictionary.into_iter().collect();
        entries.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then(a.0.cmp(&b.0)));

        let abbreviations = entries
            .into_iter()
            .filter_map(|(abbr, expansion)| {
                let pattern = format!("(?i){}", regex::escape(&abbr));
                Regex::new(&pattern).ok().map(|re| (re, expansion))
            })
            .collect();

        Self {
            abbreviations,
            expand_abbreviations,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.expand_abbreviations, &config.extra_abbreviations)
    }

    pub fn normalize(&self, raw: &str) -> String {
        let mut text: String = raw.nfc().collect();
        for (from, to) in REPLACEMENTS {
            if text.contains(from) {
                text = text.replace(from, to);
            }
        }

        text = strip_markup_decoration(&text);
        text = strip_noise_lines(&text);

        if self.expand_abbreviations {
            for (re, expansion) in &self.abbreviations {
                text = replace_isolated(&text, re, expansion);
            }
        }

        text = spell_out_numbered_headings(&text);
        text = tidy_whitespace(&text);
        text = tidy_punctuation(&text);
        text = drop_artifact_lines(&text);
        ensure_terminal_punctuation(text.trim())
    }
}

fn strip_markup_decoration(text: &str) -> String {
    static ISOLATED_HASH: OnceLock<Regex> = OnceLock::new();
    static BACKSLASH: OnceLock<Regex> = OnceLock::new();

    let mut text = text.to_string();
    for (re, replacement) in markdown_patterns() {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    text = replace_isolated(&text, regex(&ISOLATED_HASH, r"#+"), "");
    // Keep \n, \r and \t escapes, drop any other backslash.
    regex(&BACKSLASH, r"\\([nrt])?")
        .replace_all(&text, |caps: &Captures| {
            caps.get(1)
                .map(|_| caps[0].to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

fn strip_noise_lines(text: &str) -> String {
    text.split('\n')
        .filter(|line| !line_skip_patterns().iter().any(|re| re.is_match(line)))
        .map(|line| {
            let mut line = line.to_string();
            for (re, replacement) in noise_patterns() {
                if re.is_match(&line) {
                    line = re.replace_all(&line, *replacement).into_owned();
                }
            }
            line = replace_isolated_backslashes(&line);
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A backslash not followed by a word character.
fn replace_isolated_backslashes(line: &str) -> String {
    if !line.contains('\\') {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && !chars.peek().is_some_and(|n| n.is_alphanumeric() || *n == '_') {
            continue;
        }
        out.push(c);
    }
    out
}

/// "Chapter   IV" / "PART ii" style headings become "Chapter IV".
fn spell_out_numbered_headings(text: &str) -> String {
    static ROMAN: OnceLock<Regex> = OnceLock::new();
    regex(
        &ROMAN,
        r"\b((?i:chapter|part|book|capitolo|parte|chapitre|capítulo|kapitel))[ \t]+([MDCLXVI]+)\b",
    )
    .replace_all(text, "$1 $2")
    .into_owned()
}

fn tidy_whitespace(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static AROUND_NEWLINE: OnceLock<Regex> = OnceLock::new();
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();

    let text = regex(&SPACES, r"[ \t]+").replace_all(text, " ");
    let text = regex(&AROUND_NEWLINE, r" *\n *").replace_all(&text, "\n");
    regex(&BLANK_LINES, r"\n{3,}")
        .replace_all(&text, "\n\n")
        .into_owned()
}

fn tidy_punctuation(text: &str) -> String {
    static BEFORE_PUNCT: OnceLock<Regex> = OnceLock::new();
    static REPEATS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

    let mut text = regex(&BEFORE_PUNCT, r"[ \t]+([.,;:!?])")
        .replace_all(text, "$1")
        .into_owned();
    let repeats = REPEATS.get_or_init(|| {
        compile(&[
            (r"!{2,}", "!"),
            (r"\?{2,}", "?"),
            (r",{2,}", ","),
            (r";{2,}", ";"),
            (r":{2,}", ":"),
            (r"\.{4,}", "..."),
            (r#""{2,}"#, "\""),
        ])
    });
    for (re, replacement) in repeats {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    text
}

fn drop_artifact_lines(text: &str) -> String {
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();

    let kept = text
        .split('\n')
        .filter(|line| {
            let trimmed = line.trim();
            match trimmed.chars().last() {
                Some(last) => trimmed.chars().count() >= 3 || ".!?:".contains(last),
                None => true,
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    regex(&BLANK_LINES, r"\n{3,}")
        .replace_all(&kept, "\n\n")
        .into_owned()
}

fn ensure_terminal_punctuation(text: &str) -> String {
    let mut result = text.to_string();
    let last_meaningful = text
        .chars()
        .rev()
        .find(|c| !matches!(c, '"' | '\'' | ')' | ']'));
    match last_meaningful {
        None => {}
        Some(c) if matches!(c, '.' | '!' | '?' | '\u{2026}') => {}
        Some(_) => result.push('.'),
    }
    result
}

/// Remove round- and square-bracket asides, innermost first.
///
/// Horizontal whitespace left behind is collapsed and orphaned punctuation is
/// pulled back onto the preceding word. Line structure is preserved.
pub fn strip_parenthetical(text: &str) -> String {
    static ROUND: OnceLock<Regex> = OnceLock::new();
    static SQUARE: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static ORPHAN: OnceLock<Regex> = OnceLock::new();
    static LINE_EDGES: OnceLock<Regex> = OnceLock::new();

    let round = regex(&ROUND, r"\([^()]*\)");
    let square = regex(&SQUARE, r"\[[^\[\]]*\]");

    let mut current = text.to_string();
    loop {
        let next = round.replace_all(&current, "");
        let next = square.replace_all(&next, "").into_owned();
        if next == current {
            break;
        }
        current = next;
    }

    let current = regex(&SPACES, r"[ \t]+").replace_all(&current, " ");
    let current = regex(&ORPHAN, r"[ \t]+([,;:.!?])").replace_all(&current, "$1");
    let current = regex(&LINE_EDGES, r"(?m)^[ \t]+|[ \t]+$").replace_all(&current, "");
    current.trim().to_string()
}

/// Spoken form of a chapter heading: "Chapter 3: The End" -> "Chapter 3. The End."
pub fn format_heading_for_speech(heading: &str) -> String {
    static NUMBERED: OnceLock<Regex> = OnceLock::new();

    let heading = heading.trim();
    let numbered = regex(
        &NUMBERED,
        r"(?i)^(chapter|part|section|book|capitolo|parte|sezione)\s*[.:\-\u{2014}]?\s*(\d+|[ivxlcdm]+)\b\s*[.:\-\u{2014}]?\s*(.*)$",
    );
    if let Some(caps) = numbered.captures(heading) {
        let prefix = &caps[1];
        let number = &caps[2];
        let title = caps[3].trim_matches(|c: char| matches!(c, ' ' | '.' | ':' | '-' | '\u{2014}'));
        return if title.is_empty() {
            format!("{} {}.", prefix, number)
        } else {
            format!("{} {}. {}.", prefix, number, title)
        };
    }

    if heading.is_empty() || heading.ends_with(['.', '!', '?']) {
        heading.to_string()
    } else {
        format!("{}.", heading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(text: &str) -> String {
        TextNormalizer::default().normalize(text)
    }

    #[test]
    fn replaces_typographic_glyphs() {
        let text = normalize("\u{201c}Wait\u{201d}\u{2014}she said\u{2026} it was 30\u{00b0} outside");
        assert_eq!(text, "\"Wait\" - she said... it was 30 degrees outside.");
    }

    #[test]
    fn strips_markdown_and_residual_tags() {
        let text = normalize("## Heading\nSome **bold** and `code` | cell <b>tag</b> &amp;");
        assert_eq!(text, "Heading\nSome bold and code cell tag.");
    }

    #[test]
    fn keeps_hash_inside_words() {
        assert_eq!(normalize("I wrote it in C# today"), "I wrote it in C# today.");
    }

    #[test]
    fn drops_noise_lines_and_inline_references() {
        let raw = "First paragraph[12] here{3}.\n42\n***\n-----\nSee https://example.com or mail me@example.org now (see chapter 4).";
        let text = normalize(raw);
        assert_eq!(text, "First paragraph here.\nSee or mail now.");
    }

    #[test]
    fn expands_abbreviations_longest_first() {
        let text = normalize("Mr. Smith met Dr. Jones, i.e. the doctor, op. cit. page.");
        assert_eq!(
            text,
            "Mister Smith met Doctor Jones, that is the doctor, in the work cited page."
        );
    }

    #[test]
    fn abbreviations_respect_word_boundaries() {
        assert_eq!(normalize("The stmr. engine"), "The stmr. engine.");
    }

    #[test]
    fn extra_abbreviations_are_merged() {
        let mut extra = BTreeMap::new();
        extra.insert("approx.".to_string(), "roughly".to_string());
        extra.insert("pg.".to_string(), "page".to_string());
        let normalizer = TextNormalizer::new(true, &extra);
        assert_eq!(normalizer.normalize("approx. pg. ten"), "roughly page ten.");
    }

    #[test]
    fn abbreviation_expansion_can_be_disabled() {
        let normalizer = TextNormalizer::new(false, &BTreeMap::new());
        assert_eq!(normalizer.normalize("Dr. Who"), "Dr. Who.");
    }

    #[test]
    fn numbered_headings_are_tidied() {
        assert_eq!(normalize("CHAPTER   IV"), "CHAPTER IV.");
        assert_eq!(normalize("Part in the play"), "Part in the play.");
    }

    #[test]
    fn collapses_whitespace_and_punctuation() {
        let raw = "Hello   world  !!!\n\n\n\nWhat??  Really ,  yes....\"\"quoted\"\"";
        assert_eq!(normalize(raw), "Hello world!\n\nWhat? Really, yes...\"quoted\".");
    }

    #[test]
    fn drops_short_unpunctuated_lines() {
        assert_eq!(normalize("Real line of text.\nab\nOk.\nNext line"), "Real line of text.\nOk.\nNext line.");
    }

    #[test]
    fn terminal_punctuation_looks_past_quotes() {
        assert_eq!(normalize("He said \"stop!\""), "He said \"stop!\"");
        assert_eq!(normalize("He said \"stop\""), "He said \"stop\".");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn strips_nested_parentheticals() {
        let text = strip_parenthetical("He left (quickly (very) [1]) , then [see note] returned .");
        assert_eq!(text, "He left, then returned.");
    }

    #[test]
    fn strip_parenthetical_keeps_paragraphs() {
        let text = strip_parenthetical("One (a).\n\nTwo [b].");
        assert_eq!(text, "One.\n\nTwo.");
    }

    #[test]
    fn heading_formatting() {
        assert_eq!(format_heading_for_speech("Chapter 3: The End"), "Chapter 3. The End.");
        assert_eq!(format_heading_for_speech("Part IV"), "Part IV.");
        assert_eq!(format_heading_for_speech("Epilogue"), "Epilogue.");
        assert_eq!(format_heading_for_speech("Why?"), "Why?");
    }
}
