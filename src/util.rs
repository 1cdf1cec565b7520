pub fn mean(data: &[f64]) -> Option<f64> {
    let sum = data.iter().sum::<f64>();
    let count = data.len();

    match count {
        positive if positive > 0 => Some(sum / count as f64),
        _ => None,
    }
}

/// `Σ(wᵢ·xᵢ) / Σwᵢ`. `None` when the slices are empty, of different
/// lengths, or the weights sum to zero.
pub fn weighted_mean(data: &[f64], weights: &[f64]) -> Option<f64> {
    if data.is_empty() || data.len() != weights.len() {
        return None;
    }
    let total_weight = weights.iter().sum::<f64>();
    if total_weight <= 0.0 {
        return None;
    }
    let weighted = data
        .iter()
        .zip(weights)
        .map(|(value, weight)| value * weight)
        .sum::<f64>();

    Some(weighted / total_weight)
}
