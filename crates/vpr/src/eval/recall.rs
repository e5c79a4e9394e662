use std::collections::BTreeMap;

use serde::Serialize;

pub const DEFAULT_N_VALUES: [usize; 4] = [1, 5, 10, 20];

/// Recall@N per cutoff and its tab-separated percentage string.
#[derive(Debug, Clone, Serialize)]
pub struct RecallReport {
    pub recalls: BTreeMap<usize, f64>,
    /// `"{:.1} \t"` per cutoff, with `,` as the decimal separator.
    pub formatted: String,
}

impl RecallReport {
    pub fn recall_at(&self, n: usize) -> Option<f64> {
        self.recalls.get(&n).copied()
    }
}

/// Queries answered correctly within each cutoff.
///
/// A query whose first hit is within `n_values[i]` credits cutoffs `i..`.
pub fn correct_at_n(
    predictions: &[Vec<usize>],
    ground_truth: &[Vec<usize>],
    n_values: &[usize],
) -> anyhow::Result<Vec<usize>> {
    if predictions.len() != ground_truth.len() {
        anyhow::bail!(
            "{} prediction lists but {} ground-truth lists",
            predictions.len(),
            ground_truth.len()
        );
    }
    if n_values.windows(2).any(|w| w[0] >= w[1]) {
        anyhow::bail!("recall cutoffs must be strictly increasing, got {n_values:?}");
    }

    let mut correct = vec![0usize; n_values.len()];
    for (pred, gt) in predictions.iter().zip(ground_truth) {
        let first_hit = n_values
            .iter()
            .position(|&n| pred.iter().take(n).any(|p| gt.contains(p)));
        if let Some(i) = first_hit {
            for c in &mut correct[i..] {
                *c += 1;
            }
        }
    }
    Ok(correct)
}

/// Recall@N over `num_queries` queries.
pub fn compute_recalls(
    predictions: &[Vec<usize>],
    ground_truth: &[Vec<usize>],
    n_values: &[usize],
    num_queries: usize,
) -> anyhow::Result<RecallReport> {
    if num_queries == 0 {
        anyhow::bail!("cannot compute recall over zero queries");
    }
    let correct = correct_at_n(predictions, ground_truth, n_values)?;
    let recalls: BTreeMap<usize, f64> = n_values
        .iter()
        .zip(&correct)
        .map(|(&n, &c)| (n, c as f64 / num_queries as f64))
        .collect();
    let formatted = format_recalls(n_values.iter().map(|n| recalls[n]));
    Ok(RecallReport { recalls, formatted })
}

pub fn format_recalls(values: impl IntoIterator<Item = f64>) -> String {
    values
        .into_iter()
        .map(|r| format!("{:.1} \t", r * 100.0))
        .collect::<String>()
        .replace('.', ",")
}
