//! Closest-match ranking over a [`CorpusStore`] index.
//!
//! # Scoring
//!
//! Both the query and every indexed question are case-folded, stripped of
//! trailing question marks and whitespace-collapsed. The confidence of a
//! candidate is the mean of:
//!
//! 1. the Dice coefficient of their character 2- and 3-gram sets, and
//! 2. `1 - levenshtein / max_len` over characters.
//!
//! Only questions sharing at least one gram with the query are scored. The
//! result is sorted by confidence (desc) then index position (asc) and
//! truncated to `top_k`; anything below `min_confidence` is dropped.

use std::collections::HashSet;
use std::sync::Arc;

use crate::corpus_store::CorpusStore;
use crate::error::{Error, Result};
use crate::question::{strip_question_mark, AnswerToken};

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

const GRAM_SIZES: [usize; 2] = [2, 3];

/// Precomputed comparison form of a question.
#[derive(Debug, Clone, Default)]
pub(crate) struct Features {
    pub(crate) chars: Vec<char>,
    pub(crate) grams: HashSet<String>,
}

impl Features {
    pub(crate) fn new(text: &str) -> Self {
        let folded = fold(text);
        let chars: Vec<char> = folded.chars().collect();
        let grams = grams(&chars);
        Self { chars, grams }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

fn fold(text: &str) -> String {
    strip_question_mark(text.trim())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn grams(chars: &[char]) -> HashSet<String> {
    let mut out = HashSet::new();
    if chars.is_empty() {
        return out;
    }
    if chars.len() < GRAM_SIZES[0] {
        out.insert(chars.iter().collect());
        return out;
    }
    for size in GRAM_SIZES {
        for window in chars.windows(size) {
            out.insert(window.iter().collect());
        }
    }
    out
}

fn dice(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    (2 * shared) as f32 / (a.len() + b.len()) as f32
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn edit_similarity(a: &[char], b: &[char]) -> f32 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / longest as f32
}

/// Similarity in `[0, 1]` between two prepared questions.
pub(crate) fn similarity(query: &Features, candidate: &Features) -> f32 {
    let score = (dice(&query.grams, &candidate.grams)
        + edit_similarity(&query.chars, &candidate.chars))
        / 2.0;
    score.clamp(0.0, 1.0)
}

/// A ranked candidate: an encoded answer token and its confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub token: String,
    pub confidence: f32,
}

impl Match {
    pub fn decode(&self) -> Result<AnswerToken> {
        AnswerToken::decode(&self.token)
    }
}

/// Scores queries against one project's [`CorpusStore`].
pub struct MatchEngine {
    store: Arc<CorpusStore>,
    top_k: usize,
    min_confidence: f32,
}

impl MatchEngine {
    pub fn new(store: Arc<CorpusStore>, top_k: usize) -> Self {
        Self {
            store,
            top_k: top_k.max(1),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Cheap pre-check: the text has content and the index is non-empty.
    pub fn can_process(&self, text: &str) -> bool {
        !fold(text).is_empty() && !self.store.index().is_empty()
    }

    /// Ranks the indexed answers for `text`.
    pub fn process(&self, text: &str) -> Result<Vec<Match>> {
        let query = Features::new(text);
        if query.is_empty() {
            return Err(Error::invalid("query must not be empty"));
        }

        let index = self.store.index();
        let entries = index.entries();

        let mut scored: Vec<(f32, usize)> = index
            .candidates(&query)
            .into_iter()
            .map(|pos| pos as usize)
            .map(|pos| (similarity(&query, &entries[pos].features), pos))
            .filter(|(score, _)| *score >= self.min_confidence)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let matches = scored
            .into_iter()
            .flat_map(|(confidence, pos)| {
                entries[pos].answers.iter().map(move |token| Match {
                    token: token.clone(),
                    confidence,
                })
            })
            .take(self.top_k)
            .collect();

        Ok(matches)
    }
}
