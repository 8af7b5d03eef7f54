//! Data-quality stage: validation followed by deduplication.
//!
//! Sits between the upstream adapters and the store. Never fails the
//! pipeline and never mutates rows; it annotates, suppresses duplicates and
//! reports. Both sub-stages are idempotent on identical input.

pub mod dedup;
pub mod validation;

use tracing::{debug, warn};

use crate::models::{Market, OhlcvRow};
pub use dedup::{
    deduplicate_metrics, DedupStrategy, DeduplicationReport, DuplicateGroup, DuplicateType,
    MetricsDuplicateGroup,
};
pub use validation::{validate_batch, validate_metrics_row, validate_row, ValidationReport};

/// Result of running a batch through both sub-stages.
#[derive(Debug)]
pub struct ProcessedBatch {
    /// Surviving rows, input order preserved.
    pub rows: Vec<OhlcvRow>,
    /// One report per input row, including suppressed duplicates.
    pub validation: Vec<ValidationReport>,
    pub dedup: DeduplicationReport,
}

impl ProcessedBatch {
    pub fn invalid_count(&self) -> usize {
        self.validation.iter().filter(|r| !r.is_valid()).count()
    }
}

/// Validate and deduplicate an ingest batch.
///
/// Ingest policy: invalid rows are logged and kept so that backfills stay
/// observable; duplicate suppression keeps the highest-quality record.
pub fn process_batch(rows: Vec<OhlcvRow>, market: Market) -> ProcessedBatch {
    let validation = validate_batch(&rows, market);

    let invalid = validation.iter().filter(|r| !r.is_valid()).count();
    if invalid > 0 {
        warn!(
            invalid,
            total = rows.len(),
            market = market.as_str(),
            "batch contains invalid rows; keeping them with failed status"
        );
    }

    let (rows, dedup) =
        dedup::deduplicate(rows, DedupStrategy::KeepHighestQuality, Some(&validation));

    if dedup.duplicates_suppressed > 0 {
        debug!(
            suppressed = dedup.duplicates_suppressed,
            groups = dedup.groups.len(),
            "suppressed duplicate rows in ingest batch"
        );
    }

    ProcessedBatch {
        rows,
        validation,
        dedup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interval;

    fn bar(date: &str, close: f64) -> OhlcvRow {
        OhlcvRow {
            symbol: "AAPL".into(),
            interval: Interval::Daily,
            trade_date: date.into(),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            pre_close: None,
            change: None,
            pct_chg: None,
            volume: 1_000.0,
            amount: None,
            ma5: None,
            ma10: None,
            ma20: None,
            ma60: None,
        }
    }

    #[test]
    fn pipeline_keeps_invalid_rows_and_reports_them() {
        let mut broken = bar("2024-03-04", 200.0);
        broken.low = 500.0;
        let batch = process_batch(vec![bar("2024-03-01", 180.0), broken], Market::UsStock);
        assert_eq!(batch.rows.len(), 2, "invalid rows are kept, not dropped");
        assert_eq!(batch.invalid_count(), 1);
    }

    #[test]
    fn pipeline_suppresses_duplicates() {
        let batch = process_batch(
            vec![bar("2024-03-01", 180.0), bar("2024-03-01", 180.0)],
            Market::UsStock,
        );
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.dedup.duplicates_suppressed, 1);
        assert_eq!(batch.validation.len(), 2);
    }
}
