use crate::metrics::TallyMetrics;
use crate::source::{DataSource, SourceError};
use crate::traversal::aggregator::{AggregationState, DeduplicatingAggregator, PageReport};
use crate::traversal::filter::{Clock, DateRangeFilter, FilterMode, Period};
use crate::traversal::poll::PollSettings;
use crate::traversal::stability::{RenderStabilityDetector, StabilitySettings};
use crate::traversal::transition::{PageMarker, PageTransitionDetector};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const REASON_END_OF_LIST: &str = "end of list (next unavailable)";
pub const REASON_NO_CHANGE: &str = "no change after advance; assuming end of list";
pub const REASON_LOOP: &str = "loop detected";
pub const REASON_ITERATION_LIMIT: &str = "iteration limit reached";

/// Header labels of the two columns a traversal reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLabels {
    pub category: String,
    pub timestamp: String,
}

/// Everything a [`TraversalController`] needs besides its source.
#[derive(Debug, Clone)]
pub struct TraversalSettings {
    pub columns: ColumnLabels,
    pub stability: StabilitySettings,
    pub transition: PollSettings,
    /// Settle time after a page change before sampling again
    pub post_change_delay: Duration,
    /// Hard cap on advances per run
    pub max_advances: usize,
    pub period: Period,
    pub clock: Clock,
}

impl TraversalSettings {
    pub fn new(category: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            columns: ColumnLabels {
                category: category.into(),
                timestamp: timestamp.into(),
            },
            stability: StabilitySettings::default(),
            transition: PollSettings::default(),
            post_change_delay: Duration::from_millis(500),
            max_advances: 500,
            period: Period::default(),
            clock: Clock::System,
        }
    }
}

/// Observable traversal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraversalState {
    Idle,
    Positioning,
    ScanningPage,
    AdvancingPage,
    WaitingTransition,
    WaitingStable,
    Done,
    Aborted,
}

impl TraversalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraversalState::Done | TraversalState::Aborted)
    }
}

/// How a traversal ended. Aggregation state is valid in both cases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraversalOutcome {
    /// `true` for a normal end of list, `false` for an abort
    pub done: bool,
    pub reason: String,
    pub pages_scanned: usize,
    pub advances: usize,
    pub total: u64,
}

/// Progress notifications, delivered over [`TraversalController::subscribe`].
#[derive(Debug, Clone)]
pub enum TraversalEvent {
    StateChanged(TraversalState),
    PageScanned {
        page: usize,
        page_number: Option<u32>,
        report: PageReport,
        total: u64,
        status: String,
    },
    Finished(TraversalOutcome),
    Failed(String),
}

impl TraversalEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraversalEvent::Finished(_) | TraversalEvent::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    category: usize,
    timestamp: usize,
}

/// Internal step, carrying the data a state needs.
enum Step {
    Positioning,
    ScanningPage,
    AdvancingPage,
    WaitingTransition(PageMarker),
    WaitingStable,
    Finished(TraversalOutcome),
}

impl Step {
    fn state(&self) -> TraversalState {
        match self {
            Step::Positioning => TraversalState::Positioning,
            Step::ScanningPage => TraversalState::ScanningPage,
            Step::AdvancingPage => TraversalState::AdvancingPage,
            Step::WaitingTransition(_) => TraversalState::WaitingTransition,
            Step::WaitingStable => TraversalState::WaitingStable,
            Step::Finished(outcome) if outcome.done => TraversalState::Done,
            Step::Finished(_) => TraversalState::Aborted,
        }
    }
}

/// Drives a [`DataSource`] through every page of a list exactly once.
///
/// One traversal is in flight at a time (`start_traversal` takes `&mut self`).
/// All waiting is bounded polling; cancellation is by the iteration cap and
/// timeouts only.
pub struct TraversalController<S: DataSource> {
    source: S,
    settings: TraversalSettings,
    stability: RenderStabilityDetector,
    transition: PageTransitionDetector,
    aggregator: DeduplicatingAggregator,
    state: TraversalState,
    columns: Option<Columns>,
    pages_scanned: usize,
    advances: usize,
    events: Option<mpsc::UnboundedSender<TraversalEvent>>,
    metrics: Option<Arc<TallyMetrics>>,
}

impl<S: DataSource> TraversalController<S> {
    pub fn new(source: S, settings: TraversalSettings) -> Self {
        let filter = DateRangeFilter::new(FilterMode::All, settings.period, settings.clock);
        Self {
            source,
            stability: RenderStabilityDetector::new(settings.stability),
            transition: PageTransitionDetector::new(settings.transition),
            aggregator: DeduplicatingAggregator::new(filter),
            settings,
            state: TraversalState::Idle,
            columns: None,
            pages_scanned: 0,
            advances: 0,
            events: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<TallyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Receive progress events for subsequent runs.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TraversalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn state(&self) -> TraversalState {
        self.state
    }

    pub fn aggregation(&self) -> &AggregationState {
        self.aggregator.state()
    }

    /// Owned copy of the aggregation state.
    pub fn snapshot(&self) -> AggregationState {
        self.aggregator.state().clone()
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.aggregator.filter().mode()
    }

    pub fn settings(&self) -> &TraversalSettings {
        &self.settings
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn reset(&mut self) {
        self.aggregator.reset();
        self.columns = None;
        self.pages_scanned = 0;
        self.advances = 0;
        self.state = TraversalState::Idle;
    }

    /// Scan every page from the first one, starting from a clean state.
    ///
    /// Loop detection and the iteration cap end the run with `done == false`;
    /// they are partial successes, not errors. Source failures outside polling
    /// loops abort the run with `Err` and leave the state readable.
    pub async fn start_traversal(&mut self, mode: FilterMode) -> Result<TraversalOutcome, SourceError> {
        self.reset();
        self.set_mode(mode);
        info!(%mode, category = %self.settings.columns.category, "traversal started");

        match self.run().await {
            Ok(outcome) => {
                info!(
                    done = outcome.done,
                    reason = %outcome.reason,
                    pages = outcome.pages_scanned,
                    total = outcome.total,
                    "traversal finished"
                );
                self.emit(TraversalEvent::Finished(outcome.clone()));
                Ok(outcome)
            }
            Err(e) => {
                error!("traversal failed: {}", e);
                self.state = TraversalState::Aborted;
                self.emit(TraversalEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Scan only the page currently shown, accumulating into existing state.
    pub async fn scan_current_page(&mut self, mode: FilterMode) -> Result<PageReport, SourceError> {
        self.set_mode(mode);
        self.columns = Some(self.resolve_columns().await?);

        let column = self.category_column();
        let marker = PageMarker::capture(&mut self.source, column).await?;
        let page_number = marker.page_number;
        self.aggregator
            .state_mut()
            .mark_page(marker.identity_key(), page_number);
        self.scan_page(page_number).await
    }

    fn set_mode(&mut self, mode: FilterMode) {
        let filter = self.aggregator.filter().with_mode(mode);
        self.aggregator.set_filter(filter);
    }

    async fn run(&mut self) -> Result<TraversalOutcome, SourceError> {
        let mut step = Step::Positioning;
        loop {
            self.enter(step.state());
            step = match step {
                Step::Positioning => {
                    self.position().await?;
                    Step::ScanningPage
                }
                Step::ScanningPage => self.scan_step().await?,
                Step::AdvancingPage => self.advance_step().await?,
                Step::WaitingTransition(previous) => self.transition_step(previous).await?,
                Step::WaitingStable => {
                    self.refresh_columns().await;
                    let column = self.category_column();
                    let stable = self.stability.await_stable(&mut self.source, column).await?;
                    if !stable {
                        warn!("page did not settle; extracting best-effort");
                        if let Some(m) = &self.metrics {
                            m.stability_timeouts.inc();
                        }
                    }
                    Step::ScanningPage
                }
                Step::Finished(outcome) => return Ok(outcome),
            };
        }
    }

    async fn position(&mut self) -> Result<(), SourceError> {
        // Index is only a hint for the stability wait here
        let hint = match self.source.column_index(&self.settings.columns.category).await {
            Ok(c) => Some(c),
            Err(e) => {
                debug!("category column not resolvable before positioning: {}", e);
                None
            }
        };

        info!("jumping to first page");
        self.source.force_first_page().await?;
        tokio::time::sleep(self.settings.post_change_delay).await;

        if !self.stability.await_stable(&mut self.source, hint).await? {
            warn!("first page did not settle; extracting best-effort");
            if let Some(m) = &self.metrics {
                m.stability_timeouts.inc();
            }
        }
        Ok(())
    }

    async fn scan_step(&mut self) -> Result<Step, SourceError> {
        if self.columns.is_none() {
            self.columns = Some(self.resolve_columns().await?);
        }

        let column = self.category_column();
        let marker = PageMarker::capture(&mut self.source, column).await?;
        let identity = marker.identity_key();
        if self.aggregator.state().page_seen(&identity, marker.page_number) {
            warn!(
                page_number = ?marker.page_number,
                location = %marker.location,
                "reached a previously visited page; stopping to avoid a loop"
            );
            return Ok(self.finish(false, REASON_LOOP));
        }
        self.aggregator
            .state_mut()
            .mark_page(identity, marker.page_number);

        self.scan_page(marker.page_number).await?;
        Ok(Step::AdvancingPage)
    }

    async fn advance_step(&mut self) -> Result<Step, SourceError> {
        if !self.source.is_advance_available().await? {
            return Ok(self.finish(true, REASON_END_OF_LIST));
        }
        // Only an advance that would actually be issued counts against the cap
        if self.advances >= self.settings.max_advances {
            warn!(advances = self.advances, "iteration limit reached");
            return Ok(self.finish(false, REASON_ITERATION_LIMIT));
        }

        let column = self.category_column();
        let previous = PageMarker::capture(&mut self.source, column).await?;
        info!(page_number = ?previous.page_number, "advancing to next page");
        self.source.trigger_advance().await?;
        self.advances += 1;
        Ok(Step::WaitingTransition(previous))
    }

    async fn transition_step(&mut self, previous: PageMarker) -> Result<Step, SourceError> {
        let column = self.category_column();
        let changed = self
            .transition
            .await_change(&mut self.source, &previous, column)
            .await?;
        if !changed {
            if let Some(m) = &self.metrics {
                m.transition_timeouts.inc();
            }
            // An advance is never re-issued
            return Ok(self.finish(true, REASON_NO_CHANGE));
        }
        tokio::time::sleep(self.settings.post_change_delay).await;
        Ok(Step::WaitingStable)
    }

    async fn scan_page(&mut self, page_number: Option<u32>) -> Result<PageReport, SourceError> {
        let Some(columns) = self.columns else {
            return Err(SourceError::ColumnNotFound {
                label: self.settings.columns.category.clone(),
            });
        };
        let rows = self.source.visible_rows().await?;

        let source = &self.source;
        let report = self.aggregator.extract(
            &rows,
            |r| source.row_keys(r),
            |r| source.read_cell(r, columns.category),
            |r| source.read_cell(r, columns.timestamp),
        );
        self.pages_scanned += 1;

        let total = self.aggregator.state().total();
        let label = self.filter_mode().label(self.settings.period.unit);
        let status = format!(
            "Counted {} rows on this page ({}). Total: {}",
            report.added, label, total
        );
        info!(
            page = self.pages_scanned,
            page_number = ?page_number,
            added = report.added,
            duplicates = report.duplicates,
            skipped = report.skipped,
            unparseable = report.unparseable,
            total,
            "page processed"
        );

        if let Some(m) = &self.metrics {
            m.record_page(&report, total);
        }
        self.emit(TraversalEvent::PageScanned {
            page: self.pages_scanned,
            page_number,
            report,
            total,
            status,
        });
        Ok(report)
    }

    async fn resolve_columns(&mut self) -> Result<Columns, SourceError> {
        let category = self.source.column_index(&self.settings.columns.category).await?;
        let timestamp = self.source.column_index(&self.settings.columns.timestamp).await?;
        debug!(category, timestamp, "columns resolved");
        Ok(Columns { category, timestamp })
    }

    /// Re-read column positions; keeps the previous index on failure.
    async fn refresh_columns(&mut self) {
        let Some(mut columns) = self.columns else {
            return;
        };
        match self.source.column_index(&self.settings.columns.category).await {
            Ok(c) => columns.category = c,
            Err(e) => warn!("keeping category column {}: {}", columns.category, e),
        }
        match self.source.column_index(&self.settings.columns.timestamp).await {
            Ok(c) => columns.timestamp = c,
            Err(e) => warn!("keeping timestamp column {}: {}", columns.timestamp, e),
        }
        if Some(columns) != self.columns {
            info!(category = columns.category, timestamp = columns.timestamp, "columns moved");
        }
        self.columns = Some(columns);
    }

    fn category_column(&self) -> Option<usize> {
        self.columns.map(|c| c.category)
    }

    fn finish(&self, done: bool, reason: &str) -> Step {
        Step::Finished(TraversalOutcome {
            done,
            reason: reason.to_string(),
            pages_scanned: self.pages_scanned,
            advances: self.advances,
            total: self.aggregator.state().total(),
        })
    }

    fn enter(&mut self, state: TraversalState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state change");
            self.state = state;
            self.emit(TraversalEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: TraversalEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ReplayFixture, ReplaySource};

    fn controller(json: &str) -> TraversalController<ReplaySource> {
        let source = ReplaySource::new(ReplayFixture::from_json(json).unwrap());
        TraversalController::new(source, TraversalSettings::new("Fax", "Created Time"))
    }

    const THREE_PAGES: &str = r#"{
        "headers": [{"label": "Fax"}, {"label": "Created Time"}],
        "render_delay_ms": 700,
        "transition_delay_ms": 900,
        "pages": [
            {"number": 1, "rows": [
                {"id": "a", "cells": ["fax1", "2024-01-10"]},
                {"id": "b", "cells": ["fax2", "2024-01-10"]}
            ]},
            {"number": 2, "rows": [
                {"id": "c", "cells": ["fax1", "2024-01-11"]},
                {"id": "a", "cells": ["fax1", "2024-01-10"]}
            ]},
            {"number": 3, "rows": [
                {"id": "d", "cells": ["", "2024-01-12"]}
            ]}
        ]
    }"#;

    #[tokio::test(start_paused = true)]
    async fn test_traverses_all_pages_to_end_of_list() {
        let mut c = controller(THREE_PAGES);
        let outcome = c.start_traversal(FilterMode::All).await.unwrap();

        assert!(outcome.done);
        assert_eq!(outcome.reason, REASON_END_OF_LIST);
        assert_eq!(outcome.pages_scanned, 3);
        assert_eq!(outcome.advances, 2);
        assert_eq!(c.aggregation().total(), 4);
        assert_eq!(c.aggregation().count("fax1"), 2);
        assert_eq!(c.aggregation().count("(blank)"), 1);
        assert_eq!(c.state(), TraversalState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_report_each_page_then_finish() {
        let mut c = controller(THREE_PAGES);
        let mut rx = c.subscribe();
        c.start_traversal(FilterMode::All).await.unwrap();

        let mut pages = Vec::new();
        let mut finished = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                TraversalEvent::PageScanned { report, status, .. } => pages.push((report, status)),
                TraversalEvent::Finished(_) => finished = true,
                _ => {}
            }
        }
        assert!(finished);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].0.duplicates, 1);
        assert_eq!(pages[0].1, "Counted 2 rows on this page (all time). Total: 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_cap_aborts_with_partial_state() {
        let mut c = controller(THREE_PAGES);
        c.settings.max_advances = 1;
        let outcome = c.start_traversal(FilterMode::All).await.unwrap();

        assert!(!outcome.done);
        assert_eq!(outcome.reason, REASON_ITERATION_LIMIT);
        assert_eq!(outcome.pages_scanned, 2);
        assert_eq!(c.aggregation().total(), 3);
        assert_eq!(c.state(), TraversalState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_reached_on_last_page_is_end_of_list() {
        let mut c = controller(THREE_PAGES);
        c.settings.max_advances = 2;
        let outcome = c.start_traversal(FilterMode::All).await.unwrap();

        assert!(outcome.done);
        assert_eq!(outcome.reason, REASON_END_OF_LIST);
        assert_eq!(outcome.pages_scanned, 3);
        assert_eq!(outcome.advances, 2);
        assert_eq!(c.state(), TraversalState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_columns_re_resolved_after_each_transition() {
        let mut c = controller(
            r#"{
            "headers": [{"label": "Fax"}, {"label": "Created Time"}],
            "pages": [
                {"number": 1, "rows": [{"id": "a", "cells": ["fax1", "2024-01-10"]}]},
                {"number": 2, "headers": [{"label": "Created Time"}, {"label": "Fax"}],
                 "rows": [{"id": "b", "cells": ["2024-01-11", "fax2"]}]}
            ]
        }"#,
        );
        let outcome = c.start_traversal(FilterMode::All).await.unwrap();

        assert!(outcome.done);
        assert_eq!(c.aggregation().count("fax1"), 1);
        assert_eq!(c.aggregation().count("fax2"), 1);
        assert_eq!(c.aggregation().count("2024-01-11"), 0);
        assert_eq!(c.aggregation().total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_header_keeps_previous_column() {
        let mut c = controller(
            r#"{
            "headers": [{"label": "Fax"}, {"label": "Created Time"}],
            "pages": [
                {"number": 1, "rows": [{"id": "a", "cells": ["fax1", "2024-01-10"]}]},
                {"number": 2, "headers": [{"label": "Sender"}, {"label": "Created Time"}],
                 "rows": [{"id": "b", "cells": ["fax2", "2024-01-11"]}]}
            ]
        }"#,
        );
        let outcome = c.start_traversal(FilterMode::All).await.unwrap();

        assert!(outcome.done);
        assert_eq!(outcome.reason, REASON_END_OF_LIST);
        assert_eq!(outcome.pages_scanned, 2);
        assert_eq!(c.aggregation().count("fax2"), 1);
        assert_eq!(c.aggregation().total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_column_fails_the_run() {
        let mut c = controller(
            r#"{"headers": [{"label": "Fax"}], "pages": [{"rows": [{"id": "a", "cells": ["fax1"]}]}]}"#,
        );
        let err = c.start_traversal(FilterMode::All).await.unwrap_err();
        assert!(matches!(err, SourceError::ColumnNotFound { ref label } if label == "Created Time"));
        assert_eq!(c.state(), TraversalState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_traversal_resets_state() {
        let mut c = controller(THREE_PAGES);
        c.start_traversal(FilterMode::All).await.unwrap();
        let outcome = c.start_traversal(FilterMode::All).await.unwrap();
        assert_eq!(outcome.total, 4);
        assert_eq!(c.aggregation().total(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_current_page_accumulates() {
        let mut c = controller(THREE_PAGES);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = c.scan_current_page(FilterMode::All).await.unwrap();
        assert_eq!(first.added, 2);
        let again = c.scan_current_page(FilterMode::All).await.unwrap();
        assert_eq!(again.duplicates, 2);
        assert_eq!(c.aggregation().total(), 2);
        assert_eq!(c.aggregation().count("fax2"), 1);
    }
}
