// Question Batch Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Confidence at or above which a result counts as "high"
pub const HIGH_CONFIDENCE: f64 = 0.8;

/// Confidence at or above which a result counts as "medium"
pub const MEDIUM_CONFIDENCE: f64 = 0.5;

/// A question to ask the workspace, with the fragments a good answer contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub expected_fragments: Vec<String>,
}

impl Question {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        expected_fragments: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            expected_fragments,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "Question id must not be empty".to_string(),
            ));
        }
        if self.text.trim().is_empty() {
            return Err(DomainError::ValidationError(format!(
                "Question {} has empty text",
                self.id
            )));
        }
        Ok(())
    }
}

/// Outcome of asking a single question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: String,
    pub question_text: String,
    pub response: String,
    /// In [0, 1]
    pub confidence_score: f64,
    /// Seconds, including retries and backoff
    pub processing_time: f64,
    pub fragments_found: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl QuestionResult {
    /// Result for a question whose call ultimately failed
    pub fn failed(
        question: &Question,
        error: impl Into<String>,
        processing_time: f64,
        attempts: u32,
    ) -> Self {
        Self {
            question_id: question.id.clone(),
            question_text: question.text.clone(),
            response: String::new(),
            confidence_score: 0.0,
            processing_time,
            fragments_found: Vec::new(),
            success: false,
            error: Some(error.into()),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Aggregate figures over a list of question results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage in [0, 100]
    pub success_rate: f64,
    /// Mean confidence over successful results only
    pub average_confidence: f64,
    pub average_processing_time: f64,
    pub total_processing_time: f64,
    pub confidence_distribution: ConfidenceDistribution,
    /// Error kind (text before the first ':') -> occurrences
    pub error_types: BTreeMap<String, usize>,
}

impl BatchSummary {
    pub fn from_results(results: &[QuestionResult]) -> Self {
        if results.is_empty() {
            return Self::default();
        }

        let total = results.len();
        let successful: Vec<&QuestionResult> = results.iter().filter(|r| r.success).collect();
        let total_processing_time: f64 = results.iter().map(|r| r.processing_time).sum();

        let average_confidence = if successful.is_empty() {
            0.0
        } else {
            successful.iter().map(|r| r.confidence_score).sum::<f64>() / successful.len() as f64
        };

        let mut distribution = ConfidenceDistribution::default();
        for result in results {
            if result.confidence_score >= HIGH_CONFIDENCE {
                distribution.high += 1;
            } else if result.confidence_score >= MEDIUM_CONFIDENCE {
                distribution.medium += 1;
            } else {
                distribution.low += 1;
            }
        }

        let mut error_types = BTreeMap::new();
        for error in results.iter().filter_map(|r| r.error.as_deref()) {
            let kind = match error.split_once(':') {
                Some((prefix, _)) if !prefix.trim().is_empty() => prefix.trim().to_string(),
                _ => "Unknown".to_string(),
            };
            *error_types.entry(kind).or_insert(0) += 1;
        }

        Self {
            total,
            successful: successful.len(),
            failed: total - successful.len(),
            success_rate: successful.len() as f64 / total as f64 * 100.0,
            average_confidence,
            average_processing_time: total_processing_time / total as f64,
            total_processing_time,
            confidence_distribution: distribution,
            error_types,
        }
    }
}

/// Result payload stored on a question-batch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Number of questions submitted; may exceed `results.len()` after an
    /// abort or cancellation
    pub total_questions: usize,
    /// Ordered as the questions were submitted
    pub results: Vec<QuestionResult>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn new(total_questions: usize, results: Vec<QuestionResult>) -> Self {
        let summary = BatchSummary::from_results(&results);
        Self {
            total_questions,
            results,
            summary,
        }
    }
}
