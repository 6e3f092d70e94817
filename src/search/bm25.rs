//! In-memory BM25 model over the documents of a [`SearchIndex`](super::SearchIndex).
//!
//! Documents are addressed by slot id. Vacant slots contribute nothing and are
//! not counted in the corpus statistics.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// BM25 tuning constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation
    pub k1: f64,
    /// Document length normalization (0 = none, 1 = full)
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.0, b: 0.5 }
    }
}

/// Share of the mean informative idf given to terms whose idf is not positive.
pub const IDF_FLOOR_EPSILON: f64 = 0.25;

/// Raw BM25 inverse document frequency. Zero at `df = N/2`, negative above.
pub fn idf(doc_count: usize, doc_freq: usize) -> f64 {
    let n = doc_count as f64;
    let df = doc_freq as f64;
    ((n - df + 0.5) / (df + 0.5)).ln()
}

/// Postings and corpus statistics for BM25 scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Model {
    params: Bm25Params,
    /// term -> (slot, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    /// token count per slot, 0 for vacant slots
    doc_len: Vec<usize>,
    doc_count: usize,
    avg_doc_len: f64,
    /// idf used for terms whose raw idf is not positive
    #[serde(default)]
    idf_floor: f64,
}

impl Bm25Model {
    /// Build from `(slot, tokens)` pairs. Slots need not be contiguous.
    pub fn build<'a, I>(params: Bm25Params, docs: I) -> Self
    where
        I: IntoIterator<Item = (usize, &'a [String])>,
    {
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut doc_len = Vec::new();
        let mut doc_count = 0;
        let mut total_len = 0;

        for (slot, tokens) in docs {
            if doc_len.len() <= slot {
                doc_len.resize(slot + 1, 0);
            }
            doc_len[slot] = tokens.len();
            doc_count += 1;
            total_len += tokens.len();

            let mut term_counts: HashMap<&str, u32> = HashMap::new();
            for token in tokens {
                *term_counts.entry(token.as_str()).or_insert(0) += 1;
            }
            for (term, count) in term_counts {
                postings.entry(term.to_string()).or_default().push((slot, count));
            }
        }

        let avg_doc_len = if doc_count == 0 {
            0.0
        } else {
            total_len as f64 / doc_count as f64
        };

        // Common terms keep a small weight relative to the informative ones.
        // With no informative term at all (tiny corpora) the floor is zero.
        let positive: Vec<f64> = postings
            .values()
            .map(|p| idf(doc_count, p.len()))
            .filter(|v| *v > 0.0)
            .collect();
        let idf_floor = if positive.is_empty() {
            0.0
        } else {
            IDF_FLOOR_EPSILON * positive.iter().sum::<f64>() / positive.len() as f64
        };

        Self {
            params,
            postings,
            doc_len,
            doc_count,
            avg_doc_len,
            idf_floor,
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    /// idf of a term found in `doc_freq` documents, with the floor applied.
    pub fn term_idf(&self, doc_freq: usize) -> f64 {
        let raw = idf(self.doc_count, doc_freq);
        if raw > 0.0 {
            raw
        } else {
            self.idf_floor
        }
    }

    /// BM25 score per slot for every document containing a query term.
    ///
    /// Repeated query terms count once.
    pub fn score(&self, query_tokens: &[String]) -> HashMap<usize, f64> {
        let mut scores = HashMap::new();
        if self.doc_count == 0 || self.avg_doc_len == 0.0 {
            return scores;
        }

        let Bm25Params { k1, b } = self.params;
        let unique: HashSet<&str> = query_tokens.iter().map(String::as_str).collect();

        for term in unique {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let term_idf = self.term_idf(postings.len());

            for &(slot, tf) in postings {
                let tf = tf as f64;
                let len = self.doc_len.get(slot).copied().unwrap_or(0) as f64;
                let norm = tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * len / self.avg_doc_len));
                *scores.entry(slot).or_insert(0.0) += term_idf * norm;
            }
        }

        scores
    }
}
