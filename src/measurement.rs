//! Measurement result types produced by the cycle orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counts recorded after one pipeline step. Never mutated once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSample {
    /// Pipeline index this sample belongs to (0 = home step).
    pub index: usize,
    /// Defect counts per class, in controller order.
    pub counts_by_class: Vec<u32>,
    /// UTC time the step completed.
    pub timestamp: DateTime<Utc>,
    /// Set when an analysis or aggregation call for this step failed.
    pub degraded: bool,
}

impl ResultSample {
    /// Total count across all classes.
    pub fn total(&self) -> u64 {
        self.counts_by_class.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Payload handed to the persistence call when a cycle completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// When `start()` was accepted.
    pub started_at: DateTime<Utc>,
    /// When the last step completed.
    pub finished_at: DateTime<Utc>,
    /// Rotation amount in effect at the end of the run.
    pub movement_amount: f64,
    /// All samples, in index order.
    pub samples: Vec<ResultSample>,
}

impl MeasurementRecord {
    /// Sum of counts per class over all samples.
    pub fn class_totals(&self) -> Vec<u64> {
        let width = self
            .samples
            .iter()
            .map(|s| s.counts_by_class.len())
            .max()
            .unwrap_or(0);
        let mut totals = vec![0u64; width];
        for sample in &self.samples {
            for (slot, &count) in totals.iter_mut().zip(&sample.counts_by_class) {
                *slot += u64::from(count);
            }
        }
        totals
    }
}
