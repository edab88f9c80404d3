use std::path::Path;

use crate::error::Result;

/// One completed (or anomalous) training batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchEvent {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f64,
    pub metric: f64,
    /// NaN/Inf loss: the batch was logged and skipped, not applied.
    pub anomaly: bool,
}

/// Aggregated result of one epoch, with the optional validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochEvent {
    pub epoch: usize,
    pub loss: f64,
    pub metric: f64,
    pub val_loss: Option<f64>,
    pub val_metric: Option<f64>,
}

/// Append-only log of per-batch and per-epoch (loss, metric) pairs. Records
/// are write-once; nothing is mutated after append.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    batches: Vec<BatchEvent>,
    epochs: Vec<EpochEvent>,
}

impl TrainingHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&mut self, event: BatchEvent) {
        self.batches.push(event);
    }

    pub(crate) fn record_epoch(&mut self, event: EpochEvent) {
        self.epochs.push(event);
    }

    pub fn batch_events(&self) -> &[BatchEvent] {
        &self.batches
    }

    pub fn epoch_events(&self) -> &[EpochEvent] {
        &self.epochs
    }

    pub fn last_epoch(&self) -> Option<&EpochEvent> {
        self.epochs.last()
    }

    pub fn anomaly_count(&self) -> usize {
        self.batches.iter().filter(|b| b.anomaly).count()
    }

    /// Writes the epoch log as CSV, one row per epoch.
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["epoch", "loss", "metric", "val_loss", "val_metric"])?;
        for e in &self.epochs {
            writer.write_record([
                e.epoch.to_string(),
                e.loss.to_string(),
                e.metric.to_string(),
                e.val_loss.map(|v| v.to_string()).unwrap_or_default(),
                e.val_metric.map(|v| v.to_string()).unwrap_or_default(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Forward-only pass outcome: mean loss plus the compiled metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationResult {
    pub loss: f64,
    pub metric_name: &'static str,
    pub metric: f64,
}
