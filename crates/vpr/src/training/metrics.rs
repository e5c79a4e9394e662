use std::time::Duration;

use serde::Serialize;

use super::config::LossDenominator;

/// Result of one loader batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchOutcome {
    /// Every query in the batch was invalid; no optimizer step.
    Skipped,
    Trained { triplet: f64, domain: Option<f64> },
}

/// Running loss totals for one epoch.
///
/// `iterations` counts every batch drawn from a loader, skipped or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossAccumulator {
    pub triplet_sum: f64,
    pub domain_sum: f64,
    pub iterations: usize,
    pub valid_batches: usize,
    pub last_batch_loss: Option<f64>,
}

impl LossAccumulator {
    pub fn record(mut self, outcome: BatchOutcome) -> Self {
        self.iterations += 1;
        if let BatchOutcome::Trained { triplet, domain } = outcome {
            self.valid_batches += 1;
            self.triplet_sum += triplet;
            self.domain_sum += domain.unwrap_or(0.0);
            self.last_batch_loss = Some(triplet);
        }
        self
    }

    /// Average triplet loss under the chosen denominator.
    ///
    /// # Errors
    /// Returns an error if the denominator is zero.
    pub fn average_triplet(&self, denominator: LossDenominator) -> anyhow::Result<f64> {
        let n = self.denominator(denominator);
        if n == 0 {
            anyhow::bail!("no batches to average the epoch loss over ({denominator:?})");
        }
        Ok(self.triplet_sum / n as f64)
    }

    pub fn average_domain(&self, denominator: LossDenominator) -> Option<f64> {
        let n = self.denominator(denominator);
        (n > 0).then(|| self.domain_sum / n as f64)
    }

    /// Triplet and domain averages so far, `None` while the denominator is zero.
    pub fn running_averages(&self, denominator: LossDenominator) -> (Option<f64>, Option<f64>) {
        (
            self.average_triplet(denominator).ok(),
            self.average_domain(denominator),
        )
    }

    fn denominator(&self, denominator: LossDenominator) -> usize {
        match denominator {
            LossDenominator::AllIterations => self.iterations,
            LossDenominator::ValidBatches => self.valid_batches,
        }
    }
}

/// Summary of a finished training epoch.
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub triplet_loss: f64,
    pub domain_loss: Option<f64>,
    pub iterations: usize,
    pub valid_batches: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// `H:MM:SS`, prefixed with `N day(s), ` past 24 hours. Sub-second part dropped.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let rem = total % 86_400;
    let clock = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        d => format!("{d} days, {clock}"),
    }
}
