//! Book data model shared by the parsers, the planner and the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::PipelineError;

/// Average narration speed used for duration estimates.
pub const WORDS_PER_MINUTE: f64 = 150.0;

/// One unit of narrative content, in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based, unique and increasing within a book.
    pub index: usize,
    pub title: String,
    pub text: String,
    pub word_count: usize,
    pub char_count: usize,
    /// Path of the fragment the chapter came from.
    pub source_fragment: String,
}

impl Chapter {
    pub fn new(
        index: usize,
        title: impl Into<String>,
        text: impl Into<String>,
        source_fragment: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            index,
            title: title.into(),
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
            text,
            source_fragment: source_fragment.into(),
        }
    }

    pub fn estimated_minutes(&self) -> f64 {
        self.word_count as f64 / WORDS_PER_MINUTE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookInfo {
    pub title: String,
    pub author: String,
    pub language: String,
    pub publisher: String,
    pub description: String,
    pub chapters: Vec<Chapter>,
    pub total_words: usize,
    pub total_chars: usize,
    pub estimated_duration_minutes: f64,
}

impl BookInfo {
    pub fn new(title: impl Into<String>, author: impl Into<String>, chapters: Vec<Chapter>) -> Self {
        let mut info = Self {
            title: title.into(),
            author: author.into(),
            language: String::new(),
            publisher: String::new(),
            description: String::new(),
            chapters,
            total_words: 0,
            total_chars: 0,
            estimated_duration_minutes: 0.0,
        };
        info.recompute_totals();
        info
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    fn recompute_totals(&mut self) {
        self.total_words = self.chapters.iter().map(|c| c.word_count).sum();
        self.total_chars = self.chapters.iter().map(|c| c.char_count).sum();
        self.estimated_duration_minutes = self.total_words as f64 / WORDS_PER_MINUTE;
    }

    /// Copy of this book restricted to the given chapter indices.
    ///
    /// Chapter order and indices are preserved, so the result may have gaps.
    pub fn select(&self, indices: &[usize]) -> Result<BookInfo, PipelineError> {
        let wanted: HashSet<usize> = indices.iter().copied().collect();
        let chapters: Vec<Chapter> = self
            .chapters
            .iter()
            .filter(|c| wanted.contains(&c.index))
            .cloned()
            .collect();
        if chapters.is_empty() {
            return Err(PipelineError::InvalidSelection);
        }

        let mut subset = self.clone();
        subset.chapters = chapters;
        subset.recompute_totals();
        Ok(subset)
    }

    pub fn chapter(&self, index: usize) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.index == index)
    }
}

/// One synthesis unit. The ordered list of entries is the synthesis order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlanEntry {
    pub chapter_index: usize,
    pub chapter_title: String,
    /// 0-based position among the chunks of its chapter.
    pub chunk_index: usize,
    pub chunks_in_chapter: usize,
    pub text: String,
    pub char_count: usize,
}
