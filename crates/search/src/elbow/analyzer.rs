//! Elbow point detection over descending similarity scores
//!
//! Three detectors run independently and the median of those that fire is
//! taken. When none fire an adaptive rule based on the score spread decides.

use super::{CutoffMethod, ElbowDetector, ElbowDiagnostics};
use docflow_common::config::ElbowConfig;
use docflow_common::metrics;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Standard deviations above the mean a second difference must exceed
const RATE_CHANGE_SENSITIVITY: f64 = 2.0;

/// Relative drop from the top score that marks the elbow
const PERCENTAGE_DROP_THRESHOLD: f64 = 0.3;

/// Score spread under which a sequence counts as near-uniform
const UNIFORM_RANGE: f64 = 0.1;

/// Spread below which a second-difference distribution is flat
const FLAT_EPSILON: f64 = 1e-12;

/// Decides how many ranked candidates are relevant
#[derive(Debug, Clone)]
pub struct ElbowAnalyzer {
    /// Minimum number of documents to return
    pub min_docs: usize,
    /// Maximum number of scores analysed
    pub max_docs: usize,
    /// Minimum score considered relevant
    pub significance_threshold: f64,
}

impl Default for ElbowAnalyzer {
    fn default() -> Self {
        Self {
            min_docs: 3,
            max_docs: 50,
            significance_threshold: 0.15,
        }
    }
}

impl ElbowAnalyzer {
    pub fn new(min_docs: usize, max_docs: usize, significance_threshold: f64) -> Self {
        Self {
            min_docs,
            max_docs,
            significance_threshold,
        }
    }

    pub fn from_config(config: &ElbowConfig) -> Self {
        Self::new(config.min_docs, config.max_docs, config.significance_threshold)
    }

    /// Number of leading scores judged relevant, with diagnostics.
    ///
    /// `scores` must be sorted descending. The count may exceed the input
    /// length only when fewer than `min_docs` scores are given.
    pub fn find_cutoff(&self, scores: &[f64]) -> (usize, ElbowDiagnostics) {
        let (count, diagnostics) = self.analyze(scores);
        metrics::record_elbow(diagnostics.method.as_str(), count);
        (count, diagnostics)
    }

    fn analyze(&self, scores: &[f64]) -> (usize, ElbowDiagnostics) {
        if scores.len() < self.min_docs {
            warn!(
                available = scores.len(),
                min_docs = self.min_docs,
                "Insufficient similarity scores, using minimum"
            );
            return (
                self.min_docs,
                ElbowDiagnostics::new(CutoffMethod::FallbackMin, scores, 0),
            );
        }

        let scores = &scores[..scores.len().min(self.max_docs)];

        let above: Vec<f64> = scores
            .iter()
            .copied()
            .filter(|&s| s >= self.significance_threshold)
            .collect();
        let relevant: Vec<f64> = if above.len() < self.min_docs {
            debug!(
                above = above.len(),
                threshold = self.significance_threshold,
                "Too few significant scores, keeping the leading ones"
            );
            scores[..self.min_docs].to_vec()
        } else {
            above
        };

        if relevant.len() <= self.min_docs {
            let count = relevant.len();
            let mut diagnostics = ElbowDiagnostics::new(CutoffMethod::ThresholdFilter, scores, count);
            diagnostics.chosen_point = Some(count);
            return (count, diagnostics);
        }

        let mut fired = BTreeMap::new();
        for (detector, point) in [
            (ElbowDetector::KneeDetection, detect_knee_point(&relevant)),
            (ElbowDetector::RateChange, detect_rate_change(&relevant)),
            (ElbowDetector::PercentageDrop, detect_percentage_drop(&relevant)),
        ] {
            if point > 0 {
                fired.insert(detector, point);
            }
        }

        if fired.is_empty() {
            let count = self.adaptive_fallback(&relevant);
            warn!(count, "No elbow detector fired, using adaptive fallback");
            let mut diagnostics =
                ElbowDiagnostics::new(CutoffMethod::AdaptiveFallback, scores, relevant.len());
            diagnostics.chosen_point = Some(count);
            diagnostics.elbow_score = relevant.get(count.saturating_sub(1)).copied();
            return (count, diagnostics);
        }

        let points: Vec<usize> = fired.values().copied().collect();
        let count = median(&points).clamp(self.min_docs, relevant.len());

        let mut diagnostics = ElbowDiagnostics::new(CutoffMethod::Ensemble, scores, relevant.len());
        diagnostics.individual_methods = fired;
        diagnostics.chosen_point = Some(count);
        diagnostics.elbow_score = relevant.get(count - 1).copied();

        info!(count, total = scores.len(), "Elbow cutoff selected");
        (count, diagnostics)
    }

    fn adaptive_fallback(&self, scores: &[f64]) -> usize {
        let (Some(first), Some(last)) = (scores.first(), scores.last()) else {
            return self.min_docs;
        };

        if first - last < UNIFORM_RANGE {
            scores.len().min(self.max_docs / 2)
        } else {
            scores.len().min(self.min_docs.max(scores.len() / 3))
        }
    }
}

/// Median of detector results, rounding down between the two middle values
fn median(points: &[usize]) -> usize {
    let mut sorted = points.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2
    }
}

/// Perpendicular distance from `(x, y)` to the line through `a` and `b`
fn distance_to_line(x: f64, y: f64, a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let length = (dx * dx + dy * dy).sqrt();
    if length == 0.0 {
        return ((x - a.0).powi(2) + (y - a.1).powi(2)).sqrt();
    }
    ((x - a.0) * dy - (y - a.1) * dx).abs() / length
}

/// 1-based rank of the interior point furthest from the chord between the
/// first and last scores; 0 when every interior point lies on the chord
pub fn detect_knee_point(scores: &[f64]) -> usize {
    if scores.len() < 3 {
        return 0;
    }

    let first = (0.0, scores[0]);
    let last = ((scores.len() - 1) as f64, scores[scores.len() - 1]);

    let mut best = (0, 0.0);
    for (i, &score) in scores.iter().enumerate().take(scores.len() - 1).skip(1) {
        let distance = distance_to_line(i as f64, score, first, last);
        if distance > best.1 {
            best = (i, distance);
        }
    }

    if best.1 <= FLAT_EPSILON {
        0
    } else {
        best.0 + 1
    }
}

/// First position where the second difference spikes above
/// `mean + 2·stddev`; 0 without a signal
pub fn detect_rate_change(scores: &[f64]) -> usize {
    if scores.len() < 4 {
        return 0;
    }

    let first: Vec<f64> = scores.windows(2).map(|w| w[0] - w[1]).collect();
    let second: Vec<f64> = first.windows(2).map(|w| w[0] - w[1]).collect();

    let n = second.len() as f64;
    let mean = second.iter().sum::<f64>() / n;
    let variance = second.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std <= FLAT_EPSILON {
        return 0;
    }

    let threshold = mean + RATE_CHANGE_SENSITIVITY * std;
    second
        .iter()
        .position(|&d| d > threshold)
        .map(|i| i + 2)
        .unwrap_or(0)
}

/// First index whose score has dropped 30% below the top score; 0 without
/// a signal
pub fn detect_percentage_drop(scores: &[f64]) -> usize {
    let Some(&top) = scores.first() else {
        return 0;
    };
    if scores.len() < 2 || top <= 0.0 {
        return 0;
    }

    scores
        .iter()
        .skip(1)
        .position(|&s| (top - s) / top >= PERCENTAGE_DROP_THRESHOLD)
        .map(|i| i + 1)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fewer_than_min_docs_returns_min_docs() {
        let analyzer = ElbowAnalyzer::default();
        let (count, diagnostics) = analyzer.find_cutoff(&[0.9, 0.8]);
        assert_eq!(count, 3);
        assert_eq!(diagnostics.method, CutoffMethod::FallbackMin);

        let (count, _) = analyzer.find_cutoff(&[]);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_threshold_filter_keeps_leading_scores() {
        let analyzer = ElbowAnalyzer::default();
        // Only two significant scores: fall back to the first three raw scores
        let (count, diagnostics) = analyzer.find_cutoff(&[0.9, 0.5, 0.1, 0.05, 0.01]);
        assert_eq!(count, 3);
        assert_eq!(diagnostics.method, CutoffMethod::ThresholdFilter);
    }

    #[test]
    fn test_clear_elbow() {
        let scores = [
            0.92, 0.90, 0.88, 0.86, 0.40, 0.38, 0.36, 0.35, 0.34, 0.33, 0.32, 0.31, 0.30, 0.29,
        ];
        let (count, diagnostics) = ElbowAnalyzer::default().find_cutoff(&scores);

        assert_eq!(diagnostics.method, CutoffMethod::Ensemble);
        let methods = &diagnostics.individual_methods;
        assert_eq!(methods[&ElbowDetector::PercentageDrop], 4);
        assert_eq!(methods[&ElbowDetector::RateChange], 5);
        assert_eq!(methods[&ElbowDetector::KneeDetection], 5);
        assert_eq!(count, 5);
        assert_eq!(diagnostics.chosen_point, Some(5));
        assert_eq!(diagnostics.elbow_score, Some(0.40));
        assert_eq!(diagnostics.highest_score, 0.92);
        assert_eq!(diagnostics.lowest_score, 0.29);
    }

    #[test]
    fn test_monotonic_sequences_stay_in_bounds() {
        let analyzer = ElbowAnalyzer::default();
        for len in 3..60 {
            let scores: Vec<f64> = (0..len).map(|i| 0.95 - i as f64 * 0.015).collect();
            let (count, _) = analyzer.find_cutoff(&scores);
            assert!(count >= analyzer.min_docs, "len {}: {}", len, count);
            assert!(count <= len.min(analyzer.max_docs), "len {}: {}", len, count);
        }

        let decaying: Vec<f64> = (0..30).map(|i| 0.9 * 0.9f64.powi(i)).collect();
        let (count, _) = analyzer.find_cutoff(&decaying);
        assert!((3..=30).contains(&count));
    }

    #[test]
    fn test_uniform_scores_lean_large() {
        let analyzer = ElbowAnalyzer::default();
        let scores = vec![0.5; 20];
        let (count, diagnostics) = analyzer.find_cutoff(&scores);
        assert_eq!(diagnostics.method, CutoffMethod::AdaptiveFallback);
        assert_eq!(count, 20);

        let many = vec![0.5; 50];
        assert_eq!(analyzer.find_cutoff(&many).0, 25);
    }

    #[test]
    fn test_truncates_to_max_docs() {
        let analyzer = ElbowAnalyzer::new(3, 10, 0.15);
        let scores: Vec<f64> = (0..40).map(|i| 0.9 - i as f64 * 0.01).collect();
        let (count, diagnostics) = analyzer.find_cutoff(&scores);
        assert_eq!(diagnostics.total_scores, 10);
        assert!(count <= 10);
    }

    #[test]
    fn test_knee_point() {
        assert_eq!(detect_knee_point(&[0.9, 0.2, 0.1, 0.0]), 2);
        assert_eq!(detect_knee_point(&[0.5, 0.5, 0.5, 0.5]), 0);
        assert_eq!(detect_knee_point(&[0.9, 0.8]), 0);
    }

    #[test]
    fn test_rate_change_needs_four_points() {
        assert_eq!(detect_rate_change(&[0.9, 0.5, 0.1]), 0);
        assert_eq!(detect_rate_change(&[0.9, 0.8, 0.7, 0.6, 0.5]), 0);
    }

    #[test]
    fn test_percentage_drop() {
        assert_eq!(detect_percentage_drop(&[1.0, 0.9, 0.75, 0.69]), 3);
        assert_eq!(detect_percentage_drop(&[1.0, 0.95, 0.9]), 0);
        assert_eq!(detect_percentage_drop(&[0.0, 0.0]), 0);
    }

    #[test]
    fn test_median_rounds_down() {
        assert_eq!(median(&[3, 6]), 4);
        assert_eq!(median(&[5, 2, 9]), 5);
    }
}
