// Confidence Scorer - fraction of expected fragments present in a response

use crate::error::{AppError, Result};

pub const DEFAULT_SUCCESS_THRESHOLD: f64 = 0.5;

/// Scoring of one response
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    /// In [0, 1]
    pub value: f64,
    /// Matched fragments, in expected order
    pub fragments_found: Vec<String>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    success_threshold: f64,
}

impl ConfidenceScorer {
    pub fn new(success_threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&success_threshold) {
            return Err(AppError::Config(format!(
                "scoring.success_threshold must be within [0, 1], got {}",
                success_threshold
            )));
        }
        Ok(Self { success_threshold })
    }

    pub fn success_threshold(&self) -> f64 {
        self.success_threshold
    }

    /// Case-insensitive substring match of every expected fragment
    ///
    /// An empty fragment list scores 1.0.
    pub fn score(&self, response: &str, expected_fragments: &[String]) -> Score {
        if expected_fragments.is_empty() {
            return Score {
                value: 1.0,
                fragments_found: Vec::new(),
                success: 1.0 >= self.success_threshold,
            };
        }

        let haystack = response.to_lowercase();
        let fragments_found: Vec<String> = expected_fragments
            .iter()
            .filter(|fragment| haystack.contains(&fragment.to_lowercase()))
            .cloned()
            .collect();
        let value = fragments_found.len() as f64 / expected_fragments.len() as f64;

        Score {
            value,
            fragments_found,
            success: value >= self.success_threshold,
        }
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self {
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}
