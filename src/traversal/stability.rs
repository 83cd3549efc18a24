use crate::source::{DataSource, SourceError};
use crate::traversal::poll::{observe, PollBudget, PollSettings};
use crate::traversal::signature::PageSnapshot;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning for [`RenderStabilityDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilitySettings {
    pub poll: PollSettings,

    /// Consecutive equal samples required (2 = one repeat)
    pub samples: usize,

    /// Non-blank fraction of the sampled column that also counts as filled
    pub min_non_blank_ratio: f64,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            samples: 2,
            min_non_blank_ratio: 0.05,
        }
    }
}

/// Non-blank statistics of one column across a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillStats {
    pub rows: usize,
    pub non_blank: usize,
}

impl FillStats {
    /// Without a column, a row counts as non-blank if any of its cells is.
    pub fn measure<S: DataSource>(source: &S, rows: &[S::Row], column: Option<usize>) -> Self {
        let non_blank = rows
            .iter()
            .filter(|row| match column {
                Some(c) => !source.read_cell(row, c).trim().is_empty(),
                None => source.row_keys(row).cells.iter().any(|c| !c.trim().is_empty()),
            })
            .count();
        Self {
            rows: rows.len(),
            non_blank,
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.rows == 0 {
            0.0
        } else {
            self.non_blank as f64 / self.rows as f64
        }
    }

    pub fn is_filled(&self, min_ratio: f64) -> bool {
        self.non_blank >= 1 || self.ratio() >= min_ratio
    }
}

/// Decides when a freshly loaded page has finished rendering.
///
/// A page is stable once its snapshot has repeated for the configured number
/// of samples and the sampled column holds some data. Row count alone is not
/// enough: rows can exist while their cells are still blank.
#[derive(Debug, Clone)]
pub struct RenderStabilityDetector {
    settings: StabilitySettings,
}

impl RenderStabilityDetector {
    pub fn new(settings: StabilitySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &StabilitySettings {
        &self.settings
    }

    /// Wait with the configured budget.
    pub async fn await_stable<S: DataSource>(
        &self,
        source: &mut S,
        column: Option<usize>,
    ) -> Result<bool, SourceError> {
        self.await_stable_within(source, column, self.settings.poll.max_wait)
            .await
    }

    /// Returns `Ok(false)` when the budget runs out before the page settles.
    pub async fn await_stable_within<S: DataSource>(
        &self,
        source: &mut S,
        column: Option<usize>,
        max_wait: Duration,
    ) -> Result<bool, SourceError> {
        let budget = PollBudget::start(self.settings.poll.with_max_wait(max_wait));
        let required_repeats = self.settings.samples.saturating_sub(1);
        let mut previous: Option<PageSnapshot> = None;
        let mut repeats = 0usize;

        debug!(?column, max_wait_ms = budget.max_wait_ms(), "waiting for render stability");

        while budget.remaining() {
            if let Some(rows) = observe(source.visible_rows().await)? {
                if !rows.is_empty() {
                    let snapshot = PageSnapshot::capture(source, &rows, column);
                    let fill = FillStats::measure(source, &rows, column);

                    if previous.as_ref() == Some(&snapshot) {
                        repeats += 1;
                    } else {
                        repeats = 0;
                    }
                    previous = Some(snapshot);

                    if repeats >= required_repeats && fill.is_filled(self.settings.min_non_blank_ratio) {
                        info!(
                            rows = fill.rows,
                            non_blank = fill.non_blank,
                            ratio = fill.ratio(),
                            elapsed_ms = budget.elapsed_ms(),
                            "render stable"
                        );
                        return Ok(true);
                    }
                }
            }
            budget.pause().await;
        }

        warn!(waited_ms = budget.max_wait_ms(), "render stability timeout");
        Ok(false)
    }
}
