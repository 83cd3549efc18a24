use crate::traversal::PageReport;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Prometheus counters for traversal runs.
pub struct TallyMetrics {
    registry: Registry,
    pub pages_scanned: IntCounter,
    pub rows_added: IntCounter,
    pub duplicates: IntCounter,
    pub skipped: IntCounter,
    pub unparseable_timestamps: IntCounter,
    pub stability_timeouts: IntCounter,
    pub transition_timeouts: IntCounter,
    pub total: IntGauge,
}

impl TallyMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let pages_scanned = IntCounter::new("tally_pages_scanned_total", "Pages extracted")?;
        let rows_added = IntCounter::new("tally_rows_added_total", "Rows counted into a category")?;
        let duplicates = IntCounter::new("tally_rows_duplicate_total", "Rows already seen in this run")?;
        let skipped = IntCounter::new("tally_rows_skipped_total", "Rows without a usable signature")?;
        let unparseable_timestamps = IntCounter::new(
            "tally_unparseable_timestamps_total",
            "Rows excluded because their timestamp could not be parsed",
        )?;
        let stability_timeouts = IntCounter::new(
            "tally_stability_timeouts_total",
            "Pages extracted without reaching render stability",
        )?;
        let transition_timeouts = IntCounter::new(
            "tally_transition_timeouts_total",
            "Advances that produced no observable page change",
        )?;
        let total = IntGauge::new("tally_total", "Running filtered total")?;

        registry.register(Box::new(pages_scanned.clone()))?;
        registry.register(Box::new(rows_added.clone()))?;
        registry.register(Box::new(duplicates.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(unparseable_timestamps.clone()))?;
        registry.register(Box::new(stability_timeouts.clone()))?;
        registry.register(Box::new(transition_timeouts.clone()))?;
        registry.register(Box::new(total.clone()))?;

        Ok(Self {
            registry,
            pages_scanned,
            rows_added,
            duplicates,
            skipped,
            unparseable_timestamps,
            stability_timeouts,
            transition_timeouts,
            total,
        })
    }

    pub fn record_page(&self, report: &PageReport, total: u64) {
        self.pages_scanned.inc();
        self.rows_added.inc_by(report.added as u64);
        self.duplicates.inc_by(report.duplicates as u64);
        self.skipped.inc_by(report.skipped as u64);
        self.unparseable_timestamps.inc_by(report.unparseable as u64);
        self.total.set(total as i64);
    }

    /// Text exposition format of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_page_and_render() {
        let metrics = TallyMetrics::new().unwrap();
        let report = PageReport {
            rows: 5,
            added: 3,
            duplicates: 1,
            skipped: 1,
            filtered_out: 0,
            unparseable: 0,
        };
        metrics.record_page(&report, 3);
        metrics.record_page(&report, 6);

        assert_eq!(metrics.pages_scanned.get(), 2);
        assert_eq!(metrics.rows_added.get(), 6);
        assert_eq!(metrics.total.get(), 6);

        let text = metrics.render().unwrap();
        assert!(text.contains("tally_rows_added_total 6"));
        assert!(text.contains("tally_rows_skipped_total 2"));
    }
}
