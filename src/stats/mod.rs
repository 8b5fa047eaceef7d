//! Runtime statistics collection and chart-ready read path.
//!
//! Samples are appended best-effort while a job runs; a storage failure here
//! is logged and swallowed so it can never change a job's outcome. The read
//! path folds samples into parallel per-characteristic series with a
//! normalized time axis.

use std::sync::Arc;
use std::time::Duration;

use crate::core::types::JobId;
use crate::storage::{JobStore, StatSample, StorageError};

/// Characteristic name whose raw byte values are reported in MiB.
pub const MEMORY_CHARACTERISTIC: &str = "memory";

/// Span (in seconds) beyond which the time axis switches to minutes.
const MINUTES_THRESHOLD_SECS: f64 = 300.0;

/// Unit of the normalized time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAxis {
    /// Elapsed seconds since the first sample.
    Seconds,
    /// Elapsed minutes since the first sample (span exceeded 300 seconds).
    Minutes,
}

/// One row of a statistics series: a time offset and one value per
/// characteristic, in [`StatSeries::characteristics`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    /// Elapsed time since the first sample, in [`TimeAxis`] units.
    pub time: f64,
    /// Scaled values, one per characteristic.
    pub values: Vec<f64>,
}

/// Chart-ready statistics for one job.
#[derive(Debug, Clone)]
pub struct StatSeries {
    /// Characteristic names in first-seen order.
    pub characteristics: Vec<String>,
    /// Unit of the time axis.
    pub axis: TimeAxis,
    /// Data rows, oldest first.
    pub rows: Vec<SeriesRow>,
}

/// Best-effort statistics recorder bound to a store.
pub struct StatsCollector {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl StatsCollector {
    /// Create a collector sampling at the default interval (5 seconds).
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(5),
        }
    }

    /// Replace the sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The interval executors should sample at.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Append one sample. Storage failures are logged and swallowed;
    /// sampling must never affect job execution.
    pub async fn record(&self, job_id: JobId, characteristic: &str, value: f64) {
        let sample = StatSample::new(job_id, characteristic, value);
        if let Err(e) = self.store.record_stat(sample).await {
            tracing::warn!(job_id = %job_id, characteristic, error = %e, "Failed to record statistics sample");
        }
    }

    /// Fetch the chart-ready series for a job, or `None` when no samples
    /// exist.
    pub async fn series(&self, job_id: &JobId) -> Result<Option<StatSeries>, StorageError> {
        let samples = self.store.stats_for_job(job_id).await?;
        Ok(build_series(&samples))
    }
}

/// Fold raw samples into parallel per-characteristic series.
///
/// The time axis is derived from the first characteristic's samples: elapsed
/// seconds since its first sample, rescaled to minutes when the total span
/// exceeds 300 seconds. `memory` values are converted from bytes to MiB. Rows
/// are truncated to the shortest characteristic so the series stay parallel.
pub fn build_series(samples: &[StatSample]) -> Option<StatSeries> {
    let mut grouped: Vec<(String, Vec<&StatSample>)> = Vec::new();
    for sample in samples {
        match grouped.iter_mut().find(|(name, _)| name == &sample.characteristic) {
            Some((_, bucket)) => bucket.push(sample),
            None => grouped.push((sample.characteristic.clone(), vec![sample])),
        }
    }

    let (_, first) = grouped.first()?;
    let start = first.first()?.recorded_at;
    let end = first.last()?.recorded_at;
    let span_secs = (end - start).num_milliseconds() as f64 / 1000.0;
    let (axis, scale) = if span_secs > MINUTES_THRESHOLD_SECS {
        (TimeAxis::Minutes, 1.0 / 60.0)
    } else {
        (TimeAxis::Seconds, 1.0)
    };

    let row_count = grouped.iter().map(|(_, b)| b.len()).min().unwrap_or(0);
    let mut rows = Vec::with_capacity(row_count);
    for i in 0..row_count {
        let elapsed = (first[i].recorded_at - start).num_milliseconds() as f64 / 1000.0;
        let values = grouped
            .iter()
            .map(|(name, bucket)| scale_value(name, bucket[i].value))
            .collect();
        rows.push(SeriesRow {
            time: elapsed * scale,
            values,
        });
    }

    Some(StatSeries {
        characteristics: grouped.into_iter().map(|(name, _)| name).collect(),
        axis,
        rows,
    })
}

fn scale_value(characteristic: &str, raw: f64) -> f64 {
    match characteristic {
        MEMORY_CHARACTERISTIC => raw / (1024.0 * 1024.0),
        _ => raw,
    }
}
