//! Per-epoch metrics, the epoch history record, and the reference generator
//! used when no real backend is attached.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingConfig, TrainingJobId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Metrics produced by one epoch of training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
}

impl EpochMetrics {
    /// Checks every value lies in its domain: losses finite and >= 0,
    /// accuracies in [0, 1].
    pub fn validate(&self) -> TrainingResult<()> {
        for (name, value) in [("loss", self.loss), ("validation_loss", self.validation_loss)] {
            if !value.is_finite() || value < 0.0 {
                return Err(TrainingError::Backend(format!("{name} out of range: {value}")));
            }
        }
        for (name, value) in [
            ("accuracy", self.accuracy),
            ("validation_accuracy", self.validation_accuracy),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrainingError::Backend(format!("{name} out of range: {value}")));
            }
        }
        Ok(())
    }
}

/// One immutable entry of a job's training history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub job_id: TrainingJobId,
    /// 1-based, gap-free within a job.
    pub epoch_number: u32,
    pub loss: f64,
    pub accuracy: f64,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
    pub learning_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

impl EpochRecord {
    #[must_use]
    pub fn new(job_id: TrainingJobId, epoch_number: u32, metrics: EpochMetrics, learning_rate: f64) -> Self {
        Self {
            job_id,
            epoch_number,
            loss: metrics.loss,
            accuracy: metrics.accuracy,
            validation_loss: metrics.validation_loss,
            validation_accuracy: metrics.validation_accuracy,
            learning_rate,
            recorded_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> EpochMetrics {
        EpochMetrics {
            loss: self.loss,
            accuracy: self.accuracy,
            validation_loss: self.validation_loss,
            validation_accuracy: self.validation_accuracy,
        }
    }
}

/// Aggregate metrics of a finished run, taken from its last epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub final_loss: f64,
    pub final_accuracy: f64,
}

impl MetricsSummary {
    #[must_use]
    pub fn from_last(history: &[EpochRecord]) -> Option<Self> {
        history.last().map(Self::from)
    }
}

impl From<&EpochRecord> for MetricsSummary {
    fn from(record: &EpochRecord) -> Self {
        Self { final_loss: record.loss, final_accuracy: record.accuracy }
    }
}

/// Produces plausible epoch metrics: an exponentially decaying loss and a
/// rising accuracy curve, each with bounded uniform noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsGenerator {
    /// Loss at epoch 0 before decay.
    pub initial_loss: f64,
    /// Accuracy floor the curve rises from.
    pub base_accuracy: f64,
    /// Accuracy gained as epochs go to infinity.
    pub accuracy_gain: f64,
    /// Exponential decay rate per epoch.
    pub decay: f64,
    pub loss_noise: f64,
    pub accuracy_noise: f64,
    pub validation_loss_noise: f64,
    pub validation_accuracy_noise: f64,
}

impl Default for MetricsGenerator {
    fn default() -> Self {
        Self {
            initial_loss: 2.5,
            base_accuracy: 0.5,
            accuracy_gain: 0.45,
            decay: 0.3,
            loss_noise: 0.1,
            accuracy_noise: 0.05,
            validation_loss_noise: 0.2,
            validation_accuracy_noise: 0.05,
        }
    }
}

impl MetricsGenerator {
    /// Samples metrics for `epoch` (1-based) using the thread-local RNG.
    #[must_use]
    pub fn generate(&self, epoch: u32, config: &TrainingConfig) -> EpochMetrics {
        self.generate_with(&mut rand::thread_rng(), epoch, config)
    }

    /// Samples metrics with a caller-supplied RNG.
    ///
    /// The config does not change the curve shape; it is accepted so the
    /// generator is interchangeable with a backend that does use it.
    pub fn generate_with<R: Rng>(
        &self,
        rng: &mut R,
        epoch: u32,
        _config: &TrainingConfig,
    ) -> EpochMetrics {
        let decay = (-f64::from(epoch.max(1)) * self.decay).exp();

        let loss = self.initial_loss * decay + noise(rng, self.loss_noise);
        let accuracy =
            self.base_accuracy + self.accuracy_gain * (1.0 - decay) + noise(rng, self.accuracy_noise);
        let validation_loss = loss + noise(rng, self.validation_loss_noise);
        let validation_accuracy = accuracy - noise(rng, self.validation_accuracy_noise);

        EpochMetrics {
            loss: clamp_loss(loss),
            accuracy: clamp_accuracy(accuracy),
            validation_loss: clamp_loss(validation_loss),
            validation_accuracy: clamp_accuracy(validation_accuracy),
        }
    }
}

fn noise<R: Rng>(rng: &mut R, amplitude: f64) -> f64 {
    if amplitude <= 0.0 {
        return 0.0;
    }
    rng.gen_range(0.0..amplitude)
}

fn clamp_loss(value: f64) -> f64 {
    if value.is_finite() { value.max(0.0) } else { 0.0 }
}

fn clamp_accuracy(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_generated_values_stay_in_domain() {
        let generator = MetricsGenerator::default();
        let config = TrainingConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        for epoch in 1..=200 {
            for _ in 0..5 {
                let m = generator.generate_with(&mut rng, epoch, &config);
                m.validate().unwrap();
            }
        }
    }

    #[test]
    fn test_noisy_generator_is_still_clamped() {
        let generator = MetricsGenerator {
            accuracy_noise: 0.5,
            validation_accuracy_noise: 2.0,
            ..MetricsGenerator::default()
        };
        let config = TrainingConfig::default();
        let mut rng = StdRng::seed_from_u64(11);

        for epoch in 1..=50 {
            let m = generator.generate_with(&mut rng, epoch, &config);
            assert!((0.0..=1.0).contains(&m.accuracy));
            assert!((0.0..=1.0).contains(&m.validation_accuracy));
            assert!(m.loss >= 0.0 && m.validation_loss >= 0.0);
        }
    }

    #[test]
    fn test_loss_trends_down_over_training() {
        let generator = MetricsGenerator::default();
        let config = TrainingConfig { epochs: 20, ..Default::default() };
        let mut rng = StdRng::seed_from_u64(42);

        let losses: Vec<f64> =
            (1..=20).map(|e| generator.generate_with(&mut rng, e, &config).loss).collect();
        let (first, second) = losses.split_at(10);
        let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;

        assert!(mean(first) > mean(second));
    }

    #[test]
    fn test_validation_is_worse_than_training_on_average() {
        let generator = MetricsGenerator::default();
        let config = TrainingConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        let samples: Vec<EpochMetrics> =
            (0..500).map(|i| generator.generate_with(&mut rng, 1 + i % 10, &config)).collect();
        let n = samples.len() as f64;
        let gap_loss = samples.iter().map(|m| m.validation_loss - m.loss).sum::<f64>() / n;
        let gap_acc = samples.iter().map(|m| m.accuracy - m.validation_accuracy).sum::<f64>() / n;

        assert!(gap_loss >= 0.0);
        assert!(gap_acc >= 0.0);
    }

    #[test]
    fn test_validate_rejects_out_of_range_metrics() {
        let ok = EpochMetrics { loss: 0.4, accuracy: 0.8, validation_loss: 0.5, validation_accuracy: 0.7 };
        assert!(ok.validate().is_ok());
        assert!(EpochMetrics { loss: -0.1, ..ok }.validate().is_err());
        assert!(EpochMetrics { accuracy: 1.2, ..ok }.validate().is_err());
        assert!(EpochMetrics { validation_loss: f64::INFINITY, ..ok }.validate().is_err());
    }

    #[test]
    fn test_summary_uses_last_record() {
        let job_id = TrainingJobId::from("job-1");
        let history: Vec<EpochRecord> = (1..=3)
            .map(|e| {
                let m = EpochMetrics {
                    loss: 1.0 / f64::from(e),
                    accuracy: 0.5 + f64::from(e) / 10.0,
                    validation_loss: 1.0,
                    validation_accuracy: 0.5,
                };
                EpochRecord::new(job_id.clone(), e, m, 0.001)
            })
            .collect();

        let summary = MetricsSummary::from_last(&history).unwrap();
        assert_eq!(summary.final_loss, history[2].loss);
        assert_eq!(summary.final_accuracy, history[2].accuracy);
        assert!(MetricsSummary::from_last(&[]).is_none());
    }
}
