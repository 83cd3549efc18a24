use crate::source::RowKeys;
use crate::traversal::filter::{DateRangeFilter, Verdict};
use crate::traversal::signature::row_signature;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Category key used for rows whose category cell is empty.
pub const BLANK_CATEGORY: &str = "(blank)";

/// Counts and seen-sets for one traversal run.
///
/// Invariants: `total` equals the sum of `counts`; every counted row is in
/// `seen_row_signatures` (so the set is at least as large as `total`); seen
/// pages are never forgotten within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationState {
    counts: HashMap<String, u64>,
    total: u64,
    seen_row_signatures: HashSet<String>,
    seen_page_identities: HashSet<String>,
    seen_page_numbers: HashSet<u32>,
}

impl AggregationState {
    pub fn counts(&self) -> &HashMap<String, u64> {
        &self.counts
    }

    pub fn count(&self, category: &str) -> u64 {
        self.counts.get(category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn seen_rows(&self) -> usize {
        self.seen_row_signatures.len()
    }

    pub fn seen_pages(&self) -> usize {
        self.seen_page_identities.len()
    }

    /// Categories by descending count, ties broken by name.
    pub fn sorted_counts(&self) -> Vec<(&str, u64)> {
        let mut rows: Vec<(&str, u64)> = self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        rows
    }

    /// Whether this page (by identity or number) was already scanned.
    pub fn page_seen(&self, identity: &str, number: Option<u32>) -> bool {
        self.seen_page_identities.contains(identity)
            || number.map_or(false, |n| self.seen_page_numbers.contains(&n))
    }

    pub fn mark_page(&mut self, identity: String, number: Option<u32>) {
        if !identity.is_empty() {
            self.seen_page_identities.insert(identity);
        }
        if let Some(n) = number {
            self.seen_page_numbers.insert(n);
        }
    }

    fn record(&mut self, category: String) {
        *self.counts.entry(category).or_insert(0) += 1;
        self.total += 1;
    }
}

/// What one `extract` call did with a page of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub rows: usize,
    pub added: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub filtered_out: usize,
    pub unparseable: usize,
}

/// Folds rows into category counts, counting each record at most once.
///
/// A new row is marked seen before filtering, so rows outside the window are
/// evaluated exactly once no matter how often their page is revisited.
#[derive(Debug, Clone)]
pub struct DeduplicatingAggregator {
    filter: DateRangeFilter,
    state: AggregationState,
}

impl DeduplicatingAggregator {
    pub fn new(filter: DateRangeFilter) -> Self {
        Self {
            filter,
            state: AggregationState::default(),
        }
    }

    pub fn filter(&self) -> &DateRangeFilter {
        &self.filter
    }

    pub fn set_filter(&mut self, filter: DateRangeFilter) {
        self.filter = filter;
    }

    pub fn state(&self) -> &AggregationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AggregationState {
        &mut self.state
    }

    pub fn reset(&mut self) {
        self.state = AggregationState::default();
    }

    pub fn extract<R>(
        &mut self,
        rows: &[R],
        keys_of: impl Fn(&R) -> RowKeys,
        category_of: impl Fn(&R) -> String,
        timestamp_of: impl Fn(&R) -> String,
    ) -> PageReport {
        let mut report = PageReport {
            rows: rows.len(),
            ..Default::default()
        };

        for row in rows {
            let signature = row_signature(&keys_of(row));
            if signature.is_empty() {
                report.skipped += 1;
                continue;
            }
            if !self.state.seen_row_signatures.insert(signature) {
                report.duplicates += 1;
                continue;
            }

            match self.filter.evaluate(&timestamp_of(row)) {
                Verdict::Accepted => {
                    let category = category_of(row).trim().to_string();
                    let key = if category.is_empty() {
                        BLANK_CATEGORY.to_string()
                    } else {
                        category
                    };
                    self.state.record(key);
                    report.added += 1;
                }
                Verdict::OutOfWindow => report.filtered_out += 1,
                Verdict::Unparseable => {
                    report.filtered_out += 1;
                    report.unparseable += 1;
                }
            }
        }

        if report.duplicates > 0 || report.skipped > 0 {
            debug!(
                duplicates = report.duplicates,
                skipped = report.skipped,
                seen = self.state.seen_rows(),
                "row filter stats"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traversal::filter::{Clock, FilterMode, Period};
    use chrono::NaiveDateTime;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    struct Lead {
        id: &'static str,
        fax: &'static str,
        created: &'static str,
    }

    fn lead(id: &'static str, fax: &'static str, created: &'static str) -> Lead {
        Lead { id, fax, created }
    }

    fn keys(l: &Lead) -> RowKeys {
        RowKeys {
            attributes: if l.id.is_empty() {
                vec![]
            } else {
                vec![("data-id".to_string(), l.id.to_string())]
            },
            link: None,
            cells: vec![],
        }
    }

    fn scan(agg: &mut DeduplicatingAggregator, rows: &[Lead]) -> PageReport {
        agg.extract(rows, keys, |l| l.fax.to_string(), |l| l.created.to_string())
    }

    fn aggregator(mode: FilterMode) -> DeduplicatingAggregator {
        let now = NaiveDateTime::parse_from_str("2024-01-12 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        DeduplicatingAggregator::new(DateRangeFilter::new(mode, Period::default(), Clock::Fixed(now)))
    }

    fn assert_total_matches(agg: &DeduplicatingAggregator) {
        let sum: u64 = agg.state().counts().values().sum();
        assert_eq!(agg.state().total(), sum);
    }

    #[test]
    fn test_counts_page_with_all_filter() {
        let mut agg = aggregator(FilterMode::All);
        let report = scan(&mut agg, &[lead("A", "fax1", "2024-01-10"), lead("B", "fax2", "2024-01-10")]);

        assert_eq!(report.added, 2);
        assert_eq!(agg.state().count("fax1"), 1);
        assert_eq!(agg.state().count("fax2"), 1);
        assert_eq!(agg.state().total(), 2);
        assert_total_matches(&agg);
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let mut agg = aggregator(FilterMode::All);
        let page = [lead("A", "fax1", "2024-01-10"), lead("B", "fax2", "2024-01-10")];
        scan(&mut agg, &page);
        let before = agg.state().clone();

        let report = scan(&mut agg, &page);
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.added, 0);
        assert_eq!(agg.state(), &before);
    }

    #[test]
    fn test_empty_signature_is_skipped_not_counted() {
        let mut agg = aggregator(FilterMode::All);
        let report = scan(&mut agg, &[lead("", "fax1", "2024-01-10"), lead("A", "fax1", "2024-01-10")]);

        assert_eq!(report.skipped, 1);
        assert_eq!(report.duplicates, 0);
        assert_eq!(agg.state().total(), 1);
        assert_eq!(agg.state().count("fax1"), 1);
    }

    #[test]
    fn test_filtered_rows_are_marked_seen() {
        let mut agg = aggregator(FilterMode::CurrentPeriod);
        let page = [
            lead("A", "fax1", "2024-01-10"),
            lead("B", "fax1", "2023-12-01"),
            lead("C", "fax2", "n/a"),
        ];
        let report = scan(&mut agg, &page);
        assert_eq!(report.added, 1);
        assert_eq!(report.filtered_out, 2);
        assert_eq!(report.unparseable, 1);
        assert_eq!(agg.state().seen_rows(), 3);
        assert!(agg.state().seen_rows() as u64 >= agg.state().total());

        // Revisiting never re-evaluates the filtered rows
        let again = scan(&mut agg, &page);
        assert_eq!(again.duplicates, 3);
        assert_eq!(again.filtered_out, 0);
    }

    #[test]
    fn test_blank_category_key() {
        let mut agg = aggregator(FilterMode::All);
        scan(&mut agg, &[lead("A", "  ", "2024-01-10")]);
        assert_eq!(agg.state().count(BLANK_CATEGORY), 1);
    }

    #[test]
    fn test_sorted_counts_descending() {
        let mut agg = aggregator(FilterMode::All);
        scan(
            &mut agg,
            &[
                lead("1", "b", "x"),
                lead("2", "a", "x"),
                lead("3", "a", "x"),
                lead("4", "c", "x"),
            ],
        );
        assert_eq!(agg.state().sorted_counts(), vec![("a", 2), ("b", 1), ("c", 1)]);
    }

    #[test]
    fn test_page_seen_sets() {
        let mut state = AggregationState::default();
        assert!(!state.page_seen("p1", Some(1)));
        state.mark_page("p1".into(), Some(1));
        assert!(state.page_seen("p1", None));
        assert!(state.page_seen("other", Some(1)));
        assert!(!state.page_seen("other", Some(2)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut agg = aggregator(FilterMode::All);
        scan(&mut agg, &[lead("A", "fax1", "2024-01-10")]);
        agg.state_mut().mark_page("p1".into(), Some(1));
        agg.reset();
        assert_eq!(agg.state(), &AggregationState::default());
    }

    proptest! {
        #[test]
        fn prop_total_matches_counts_after_every_extract(
            pages in prop::collection::vec(
                prop::collection::vec((0u8..20, 0u8..4, any::<bool>()), 0..12),
                1..6,
            )
        ) {
            let mut agg = aggregator(FilterMode::CurrentPeriod);
            for page in &pages {
                let rows: Vec<(String, String, String)> = page
                    .iter()
                    .map(|(id, cat, recent)| {
                        let created = if *recent { "2024-01-10" } else { "2023-06-01" };
                        (format!("r{}", id), format!("fax{}", cat), created.to_string())
                    })
                    .collect();
                let before = agg.state().seen_rows();
                let report = agg.extract(
                    &rows,
                    |r| RowKeys { attributes: vec![("data-id".into(), r.0.clone())], ..Default::default() },
                    |r| r.1.clone(),
                    |r| r.2.clone(),
                );
                let sum: u64 = agg.state().counts().values().sum();
                prop_assert_eq!(agg.state().total(), sum);
                prop_assert!(agg.state().seen_rows() as u64 >= agg.state().total());
                prop_assert_eq!(agg.state().seen_rows() - before, report.added + report.filtered_out);
                prop_assert_eq!(report.rows, report.added + report.filtered_out + report.duplicates + report.skipped);
            }
        }

        #[test]
        fn prop_second_scan_changes_nothing(ids in prop::collection::vec(0u8..30, 0..20)) {
            let mut agg = aggregator(FilterMode::All);
            let rows: Vec<String> = ids.iter().map(|i| format!("r{}", i)).collect();
            let keys_of = |r: &String| RowKeys { attributes: vec![("data-id".into(), r.clone())], ..Default::default() };
            agg.extract(&rows, keys_of, |r| r.clone(), |_| String::new());
            let before = agg.state().clone();
            let report = agg.extract(&rows, keys_of, |r| r.clone(), |_| String::new());
            prop_assert_eq!(report.duplicates, rows.len());
            prop_assert_eq!(agg.state(), &before);
        }
    }
}
