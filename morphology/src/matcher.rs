use crate::normalizer::Normalizer;
use harvester_core::{KeywordMode, KeywordSet, MatchResult, RawComment};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

/// Unicode words that contain at least one letter. Numbers and punctuation never match.
pub fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.unicode_words()
        .filter(|word| word.chars().any(char::is_alphabetic))
}

#[derive(Debug, Clone)]
struct CompiledKeyword {
    keyword: String,
    /// Lemmas of every word of the keyword
    words: Vec<Vec<String>>,
}

/// Keyword filter with canonical forms computed once per run.
#[derive(Clone)]
pub struct KeywordMatcher {
    normalizer: Arc<dyn Normalizer>,
    keywords: Vec<CompiledKeyword>,
    mode: KeywordMode,
}

impl KeywordMatcher {
    pub fn new(normalizer: Arc<dyn Normalizer>, keywords: &KeywordSet) -> Self {
        let compiled: Vec<CompiledKeyword> = keywords
            .iter()
            .map(|keyword| CompiledKeyword {
                keyword: keyword.as_str().to_string(),
                words: tokenize(keyword.as_str())
                    .map(|word| normalizer.lemmas(word))
                    .collect(),
            })
            .collect();

        for keyword in &compiled {
            debug!("Keyword '{}' -> {:?}", keyword.keyword, keyword.words);
        }

        Self {
            normalizer,
            keywords: compiled,
            mode: keywords.mode(),
        }
    }

    /// Whether filtering is switched on at all.
    pub fn is_filtering(&self) -> bool {
        !self.keywords.is_empty()
    }

    pub fn mode(&self) -> KeywordMode {
        self.mode
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }

        let text_lemmas: HashSet<String> = tokenize(text)
            .flat_map(|token| self.normalizer.lemmas(token))
            .collect();

        // Multi-word keywords need every one of their words somewhere in the text.
        let found = |keyword: &CompiledKeyword| {
            !keyword.words.is_empty()
                && keyword
                    .words
                    .iter()
                    .all(|lemmas| lemmas.iter().any(|l| text_lemmas.contains(l)))
        };

        match self.mode {
            KeywordMode::Any => self.keywords.iter().any(found),
            KeywordMode::All => self.keywords.iter().all(found),
        }
    }

    pub fn evaluate(&self, comment: RawComment) -> MatchResult {
        let passed = self.matches(&comment.text);
        MatchResult { comment, passed }
    }
}

impl std::fmt::Debug for KeywordMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordMatcher")
            .field("keywords", &self.keywords)
            .field("mode", &self.mode)
            .finish()
    }
}
