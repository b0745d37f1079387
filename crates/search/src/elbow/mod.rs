//! Elbow-based relevance cutoff
//!
//! Similarity scores from nearest-neighbour search decay roughly
//! monotonically. Instead of a fixed top-K, the cutoff is placed where the
//! decay flattens out.

mod analyzer;
mod retrieval;

pub use analyzer::{detect_knee_point, detect_percentage_drop, detect_rate_change, ElbowAnalyzer};
pub use retrieval::ElbowRetrieval;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a cutoff was decided
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CutoffMethod {
    /// Fewer scores than the minimum
    FallbackMin,
    /// Few enough significant scores to keep them all
    ThresholdFilter,
    /// Median of the detectors that fired
    Ensemble,
    /// No detector fired; decided by score spread
    AdaptiveFallback,
    /// Vector search was empty; lexical matches kept up to the minimum
    LexicalFallback,
    /// Nothing retrieved
    NoResults,
}

impl CutoffMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CutoffMethod::FallbackMin => "fallback_min",
            CutoffMethod::ThresholdFilter => "threshold_filter",
            CutoffMethod::Ensemble => "ensemble",
            CutoffMethod::AdaptiveFallback => "adaptive_fallback",
            CutoffMethod::LexicalFallback => "lexical_fallback",
            CutoffMethod::NoResults => "no_results",
        }
    }
}

/// Individual elbow detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ElbowDetector {
    KneeDetection,
    RateChange,
    PercentageDrop,
}

/// Score range of a cut result set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SimilarityRange {
    pub highest: f64,
    pub lowest: f64,
    pub cutoff_score: f64,
}

/// Why the cutoff landed where it did
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElbowDiagnostics {
    pub method: CutoffMethod,

    /// Results of the detectors that fired
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub individual_methods: BTreeMap<ElbowDetector, usize>,

    pub chosen_point: Option<usize>,

    /// Scores analysed, after truncation
    pub total_scores: usize,

    /// Scores kept by the significance filter
    pub relevant_scores: usize,

    pub highest_score: f64,
    pub lowest_score: f64,

    /// Score at the cutoff position
    pub elbow_score: Option<f64>,

    /// Candidates fetched before the cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_retrieval_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_range: Option<SimilarityRange>,
}

impl ElbowDiagnostics {
    pub(crate) fn new(method: CutoffMethod, scores: &[f64], relevant_scores: usize) -> Self {
        Self {
            method,
            individual_methods: BTreeMap::new(),
            chosen_point: None,
            total_scores: scores.len(),
            relevant_scores,
            highest_score: scores.first().copied().unwrap_or(0.0),
            lowest_score: scores.last().copied().unwrap_or(0.0),
            elbow_score: None,
            initial_retrieval_count: None,
            similarity_range: None,
        }
    }
}
