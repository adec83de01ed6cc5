//! Bounded-size synthesis units.

use crate::model::{BookInfo, Chapter, ChunkPlanEntry};
use crate::normalize::strip_parenthetical;

/// Sentence delimiters tried in order when a paragraph is over budget.
const SENTENCE_SEPARATORS: &[&str] = &[". ", "! ", "? ", "; "];

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split text into chunks of at most `max_chars` characters, keeping
/// paragraphs together where possible and sentences intact otherwise.
///
/// A single sentence longer than the budget stays one oversized chunk.
/// Never returns an empty list: degenerate input comes back unchanged.
pub fn split_text_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split('\n') {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            if !current.is_empty() {
                current.push('\n');
            }
            continue;
        }

        if char_len(&current) + char_len(paragraph) + 1 > max_chars {
            flush(&mut chunks, &current);

            if char_len(paragraph) > max_chars {
                let mut buffer = String::new();
                for sentence in split_sentences(paragraph) {
                    if char_len(&buffer) + char_len(&sentence) + 1 > max_chars {
                        flush(&mut chunks, &buffer);
                        buffer = sentence;
                    } else if buffer.is_empty() {
                        buffer = sentence;
                    } else {
                        buffer.push(' ');
                        buffer.push_str(&sentence);
                    }
                }
                current = buffer;
            } else {
                current = paragraph.to_string();
            }
        } else if current.is_empty() {
            current = paragraph.to_string();
        } else {
            // A pending soft paragraph break already separates the two.
            if !current.ends_with('\n') {
                current.push(' ');
            }
            current.push_str(paragraph);
        }
    }
    flush(&mut chunks, &current);

    if chunks.is_empty() {
        vec![text.to_string()]
    } else {
        chunks
    }
}

fn flush(chunks: &mut Vec<String>, buffer: &str) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Split on the first separator that occurs in the paragraph, keeping the
/// punctuation with its sentence.
fn split_sentences(paragraph: &str) -> Vec<String> {
    for separator in SENTENCE_SEPARATORS {
        if paragraph.contains(separator) {
            let parts: Vec<&str> = paragraph.split(separator).collect();
            let last = parts.len() - 1;
            let mark = separator.trim_end();
            return parts
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    if i < last {
                        format!("{}{}", part, mark)
                    } else {
                        part.to_string()
                    }
                })
                .collect();
        }
    }
    vec![paragraph.to_string()]
}

/// Text a chapter is narrated from: its title as a lead sentence, then the
/// body without parenthetical asides.
pub fn narration_text(chapter: &Chapter) -> String {
    let title = chapter.title.trim();
    let body = strip_parenthetical(&chapter.text);
    if title.is_empty() {
        return body;
    }
    let lead = if title.ends_with(['.', '!', '?']) {
        title.to_string()
    } else {
        format!("{}.", title)
    };
    format!("{}\n\n{}", lead, body)
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    max_chars: usize,
}

impl ChunkPlanner {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Plan in chapter order, then chunk order within each chapter.
    pub fn plan_chunks(&self, chapters: &[Chapter]) -> Vec<ChunkPlanEntry> {
        let mut plan = Vec::new();
        for chapter in chapters {
            let chunks = split_text_into_chunks(&narration_text(chapter), self.max_chars);
            let count = chunks.len();
            plan.extend(chunks.into_iter().enumerate().map(|(i, text)| ChunkPlanEntry {
                chapter_index: chapter.index,
                chapter_title: chapter.title.clone(),
                chunk_index: i,
                chunks_in_chapter: count,
                char_count: char_len(&text),
                text,
            }));
        }
        plan
    }

    pub fn plan_book(&self, book: &BookInfo) -> Vec<ChunkPlanEntry> {
        self.plan_chunks(&book.chapters)
    }
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        Self::new(2000)
    }
}
