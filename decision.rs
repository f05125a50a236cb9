use crate::error::{Error, Result};
use crate::models::ClassificationResult;

/// Converts raw logits into a labelled probability distribution and a top-1 decision.
///
/// `labels` must be in the order the model was exported with; a mismatch
/// silently swaps class names, so the order comes from the model's config.
pub fn decide(logits: &[f32], labels: &[String]) -> Result<ClassificationResult> {
    if labels.is_empty() {
        return Err(Error::Config("no class labels configured".into()));
    }
    if logits.len() != labels.len() {
        return Err(Error::MalformedOutput {
            expected: labels.len(),
            actual: logits.len(),
        });
    }
    if let Some(bad) = logits.iter().find(|v| !v.is_finite()) {
        return Err(Error::Inference(format!("model produced a non-finite logit: {bad}")));
    }
    let probs = softmax(logits);
    let (best, confidence) = argmax(&probs);
    Ok(ClassificationResult {
        prediction: labels[best].clone(),
        confidence,
        probabilities: labels.iter().cloned().zip(probs).collect(),
    })
}

/// Softmax with the maximum logit subtracted before exponentiating.
///
/// Identical to `exp(x_i) / sum(exp(x))` in exact arithmetic, but does not
/// overflow to `inf / inf` for large logits.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut exps = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for v in values {
        let e = (v - max_val).exp();
        exps.push(e);
        sum += e;
    }
    if sum <= 0.0 {
        return vec![0.0; values.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

/// Index and value of the largest entry; ties keep the first one seen.
fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (idx, score) in values.iter().enumerate() {
        if *score > best_score {
            best_score = *score;
            best = idx;
        }
    }
    (best, best_score)
}
