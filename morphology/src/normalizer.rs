use rust_stemmers::{Algorithm, Stemmer};

/// Reduces words to a canonical form so inflected variants compare equal.
pub trait Normalizer: Send + Sync {
    fn canonical_form(&self, word: &str) -> String;

    /// Every canonical form the word may have. Ambiguous words have several
    /// (стали is a form of both сталь and стать).
    fn lemmas(&self, word: &str) -> Vec<String> {
        vec![self.canonical_form(word)]
    }

    /// True when the two words share a canonical form.
    fn is_form_of(&self, word: &str, keyword: &str) -> bool {
        let word_lemmas = self.lemmas(word);
        self.lemmas(keyword)
            .iter()
            .any(|lemma| word_lemmas.contains(lemma))
    }
}

/// Lowercase, strip leading/trailing punctuation and fold `ё` into `е`.
pub fn clean_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c == 'ё' { 'е' } else { c })
        .collect()
}

/// Exact-match fallback: the cleaned word is its own canonical form.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowercaseNormalizer;

impl Normalizer for LowercaseNormalizer {
    fn canonical_form(&self, word: &str) -> String {
        clean_word(word)
    }
}

/// Alphabet a stemming backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Cyrillic,
    Latin,
}

impl Script {
    fn contains(&self, c: char) -> bool {
        match self {
            Script::Cyrillic => matches!(c, '\u{0400}'..='\u{04FF}' | '\u{0500}'..='\u{052F}'),
            Script::Latin => c.is_ascii_alphabetic() || matches!(c, '\u{00C0}'..='\u{024F}'),
        }
    }

    /// True when the word has letters and all of them belong to this script.
    pub(crate) fn covers(&self, word: &str) -> bool {
        let mut letters = word.chars().filter(|c| c.is_alphabetic()).peekable();
        letters.peek().is_some() && letters.all(|c| self.contains(c))
    }
}

/// Snowball stemming with a fallback to the cleaned word for foreign scripts.
pub struct SnowballNormalizer {
    stemmer: Stemmer,
    algorithm: Algorithm,
    script: Script,
}

impl Clone for SnowballNormalizer {
    fn clone(&self) -> Self {
        // Stemmer is not Clone
        Self::new(self.algorithm, self.script)
    }
}

impl std::fmt::Debug for SnowballNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowballNormalizer")
            .field("algorithm", &self.algorithm)
            .field("script", &self.script)
            .finish()
    }
}

impl SnowballNormalizer {
    pub fn new(algorithm: Algorithm, script: Script) -> Self {
        Self {
            stemmer: Stemmer::create(algorithm),
            algorithm,
            script,
        }
    }

    pub fn russian() -> Self {
        Self::new(Algorithm::Russian, Script::Cyrillic)
    }

    pub fn english() -> Self {
        Self::new(Algorithm::English, Script::Latin)
    }
}

impl Default for SnowballNormalizer {
    fn default() -> Self {
        Self::russian()
    }
}

impl Normalizer for SnowballNormalizer {
    fn canonical_form(&self, word: &str) -> String {
        let cleaned = clean_word(word);
        if cleaned.is_empty() || !self.script.covers(&cleaned) {
            return cleaned;
        }

        let stem = self.stemmer.stem(&cleaned).into_owned();
        if stem.is_empty() {
            cleaned
        } else {
            stem
        }
    }
}
