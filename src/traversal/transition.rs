use crate::source::{DataSource, SourceError};
use crate::traversal::poll::{observe, PollBudget, PollSettings};
use crate::traversal::signature::PageSnapshot;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a page looked like right before an advance was issued.
#[derive(Debug, Clone)]
pub struct PageMarker {
    pub location: String,
    pub snapshot: PageSnapshot,
    pub page_number: Option<u32>,
}

impl PageMarker {
    /// Sample the page currently shown.
    pub async fn capture<S: DataSource>(source: &mut S, column: Option<usize>) -> Result<Self, SourceError> {
        let location = source.page_identity().await?;
        let rows = source.visible_rows().await?;
        let snapshot = PageSnapshot::capture(source, &rows, column);
        let page_number = source.page_number().await?;
        Ok(Self {
            location,
            snapshot,
            page_number,
        })
    }

    /// Key recorded in the seen-page set: location plus content boundary.
    pub fn identity_key(&self) -> String {
        format!("{}#{}", self.location, self.snapshot.signature())
    }
}

/// Which piece of evidence showed that an advance took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEvidence {
    pub location_changed: bool,
    pub content_changed: bool,
    pub page_number_changed: bool,
}

impl TransitionEvidence {
    pub fn any(&self) -> bool {
        self.location_changed || self.content_changed || self.page_number_changed
    }
}

/// Decides whether an advance action actually produced a new page.
///
/// Any single signal is sufficient: location change, content change, or page
/// number change. Hosts surface pagination differently and none of the three
/// is reliable on its own.
#[derive(Debug, Clone)]
pub struct PageTransitionDetector {
    settings: PollSettings,
}

impl PageTransitionDetector {
    pub fn new(settings: PollSettings) -> Self {
        Self { settings }
    }

    pub async fn await_change<S: DataSource>(
        &self,
        source: &mut S,
        previous: &PageMarker,
        column: Option<usize>,
    ) -> Result<bool, SourceError> {
        self.await_change_within(source, previous, column, self.settings.max_wait)
            .await
    }

    /// `Ok(false)` after `max_wait` means the list has no further pages.
    pub async fn await_change_within<S: DataSource>(
        &self,
        source: &mut S,
        previous: &PageMarker,
        column: Option<usize>,
        max_wait: Duration,
    ) -> Result<bool, SourceError> {
        let budget = PollBudget::start(self.settings.with_max_wait(max_wait));
        debug!(
            location = %previous.location,
            signature = %previous.snapshot.signature(),
            page_number = ?previous.page_number,
            "watching for page transition"
        );

        while budget.remaining() {
            budget.pause().await;

            let evidence = self.sample(source, previous, column).await?;
            if evidence.any() {
                info!(
                    location_changed = evidence.location_changed,
                    content_changed = evidence.content_changed,
                    page_number_changed = evidence.page_number_changed,
                    elapsed_ms = budget.elapsed_ms(),
                    "page transition detected"
                );
                return Ok(true);
            }
        }

        warn!(waited_ms = budget.max_wait_ms(), "no page transition observed");
        Ok(false)
    }

    async fn sample<S: DataSource>(
        &self,
        source: &mut S,
        previous: &PageMarker,
        column: Option<usize>,
    ) -> Result<TransitionEvidence, SourceError> {
        let location_changed = observe(source.page_identity().await)?
            .map_or(false, |location| location != previous.location);

        let content_changed = observe(source.visible_rows().await)?.map_or(false, |rows| {
            let snapshot = PageSnapshot::capture(&*source, &rows, column);
            !snapshot.is_empty() && snapshot != previous.snapshot
        });

        let page_number_changed = match previous.page_number {
            Some(prev) => observe(source.page_number().await)?
                .flatten()
                .map_or(false, |current| current != prev),
            None => false,
        };

        Ok(TransitionEvidence {
            location_changed,
            content_changed,
            page_number_changed,
        })
    }
}
