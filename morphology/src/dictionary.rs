//! Dictionary lemmatization for Russian.
//!
//! Stemming cannot relate forms whose stem alternates (куплю / купить,
//! хочу / хотеть) and happily merges unrelated words that share a prefix.
//! The OpenCorpora dictionary knows the actual paradigm of every word, so
//! Cyrillic words are reduced to their dictionary lemmas. Words the analyzer
//! has no parse for fall back to Snowball stemming.

use crate::normalizer::{clean_word, Normalizer, Script, SnowballNormalizer};
use rsmorphy::prelude::*;
use std::time::Instant;
use tracing::info;

pub struct DictionaryNormalizer {
    morph: MorphAnalyzer,
    fallback: SnowballNormalizer,
}

impl DictionaryNormalizer {
    /// Loads the bundled Russian dictionary. This takes a noticeable moment,
    /// so build one instance and share it.
    pub fn russian() -> Self {
        let started = Instant::now();
        let morph = MorphAnalyzer::from_file(rsmorphy_dict_ru::DICT_PATH);
        info!(
            "Loaded Russian morphology dictionary in {:?}",
            started.elapsed()
        );

        Self {
            morph,
            fallback: SnowballNormalizer::russian(),
        }
    }
}

impl Normalizer for DictionaryNormalizer {
    fn canonical_form(&self, word: &str) -> String {
        self.lemmas(word).into_iter().next().unwrap_or_default()
    }

    fn lemmas(&self, word: &str) -> Vec<String> {
        let cleaned = clean_word(word);
        if !Script::Cyrillic.covers(&cleaned) {
            return vec![self.fallback.canonical_form(&cleaned)];
        }

        let mut lemmas: Vec<String> = Vec::new();
        for parsed in self.morph.parse(&cleaned) {
            let lemma = clean_word(&parsed.lex.get_normal_form(&self.morph));
            if !lemma.is_empty() && !lemmas.contains(&lemma) {
                lemmas.push(lemma);
            }
        }

        if lemmas.is_empty() {
            lemmas.push(self.fallback.canonical_form(&cleaned));
        }
        lemmas
    }
}

impl std::fmt::Debug for DictionaryNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryNormalizer")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// One dictionary per test binary.
#[cfg(test)]
pub(crate) fn shared() -> std::sync::Arc<DictionaryNormalizer> {
    use std::sync::{Arc, OnceLock};

    static DICTIONARY: OnceLock<Arc<DictionaryNormalizer>> = OnceLock::new();
    DICTIONARY
        .get_or_init(|| Arc::new(DictionaryNormalizer::russian()))
        .clone()
}
