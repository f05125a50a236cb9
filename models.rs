use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Outcome of a single scan analysis.
///
/// `probabilities` keeps the model's class order and serializes as a JSON
/// object keyed by label, in that order. Deserializing goes through
/// `serde_json`'s map, which sorts keys, so a parsed result does not keep
/// class order.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub prediction: String,
    pub confidence: f32,
    #[serde_as(as = "serde_with::Map<_, _>")]
    pub probabilities: Vec<(String, f32)>,
}

impl ClassificationResult {
    pub fn probability_of(&self, label: &str) -> Option<f32> {
        self.probabilities
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, p)| *p)
    }

    /// Classes sorted by descending probability; equal scores keep model order.
    pub fn ranked(&self) -> Vec<(&str, f32)> {
        let mut ranked: Vec<(&str, f32)> = self
            .probabilities
            .iter()
            .map(|(label, p)| (label.as_str(), *p))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Completed(ClassificationResult),
    /// A newer request started before this one finished; its result was dropped.
    Superseded,
}

impl AnalysisOutcome {
    pub fn into_result(self) -> Option<ClassificationResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Superseded => None,
        }
    }
}
