//! Scripted list view for offline runs and tests.
//!
//! A fixture describes pages of rows plus the timing of the fake host:
//! advances take effect after `transition_delay_ms` (plus random jitter) and
//! cells stay blank for `render_delay_ms` after a page appears.

use crate::source::lookup::{resolve_column, HeaderCell};
use crate::source::{DataSource, RowKeys, SourceError};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One row of a fixture page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRow {
    /// Record id, exposed as a `data-id` attribute
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub link: Option<String>,

    #[serde(default)]
    pub cells: Vec<String>,

    /// Hidden rows are never returned by `visible_rows`
    #[serde(default)]
    pub hidden: bool,
}

impl ReplayRow {
    fn is_countable(&self) -> bool {
        !self.hidden && !self.cells.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPage {
    /// Page number shown by the pager, if any
    #[serde(default)]
    pub number: Option<u32>,

    #[serde(default)]
    pub location: Option<String>,

    /// Headers shown while this page is up; the fixture headers otherwise
    #[serde(default)]
    pub headers: Option<Vec<HeaderCell>>,

    #[serde(default)]
    pub rows: Vec<ReplayRow>,

    /// Failure reported whenever this page's rows are read
    #[serde(default)]
    pub error: Option<String>,

    /// Index of the page the next control leads to; defaults to the following page
    #[serde(default)]
    pub next: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFixture {
    pub headers: Vec<HeaderCell>,
    pub pages: Vec<ReplayPage>,

    #[serde(default)]
    pub start_page: usize,

    #[serde(default)]
    pub render_delay_ms: u64,

    #[serde(default)]
    pub transition_delay_ms: u64,

    #[serde(default)]
    pub jitter_ms: u64,

    #[serde(default)]
    pub seed: u64,
}

impl ReplayFixture {
    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        let fixture: Self =
            serde_json::from_str(json).map_err(|e| SourceError::Fixture(e.to_string()))?;
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Fixture(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    fn validate(&self) -> Result<(), SourceError> {
        if self.pages.is_empty() {
            return Err(SourceError::Fixture("fixture has no pages".into()));
        }
        if self.start_page >= self.pages.len() {
            return Err(SourceError::Fixture(format!(
                "start_page {} out of range",
                self.start_page
            )));
        }
        for (i, page) in self.pages.iter().enumerate() {
            if let Some(next) = page.next {
                if next >= self.pages.len() {
                    return Err(SourceError::Fixture(format!(
                        "page {} links to missing page {}",
                        i, next
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn location_of(&self, index: usize) -> String {
        self.pages
            .get(index)
            .and_then(|p| p.location.clone())
            .unwrap_or_else(|| format!("replay://list?page={}", index + 1))
    }

    pub fn next_of(&self, index: usize) -> Option<usize> {
        let page = self.pages.get(index)?;
        match page.next {
            Some(n) => Some(n),
            None if index + 1 < self.pages.len() => Some(index + 1),
            None => None,
        }
    }

    /// Countable rows across all pages.
    pub fn row_count(&self) -> usize {
        self.pages
            .iter()
            .flat_map(|p| p.rows.iter())
            .filter(|r| r.is_countable())
            .count()
    }
}

/// [`DataSource`] over a [`ReplayFixture`], driven by the tokio clock.
pub struct ReplaySource {
    fixture: ReplayFixture,
    current: usize,
    shown_at: Instant,
    pending: Option<(usize, Instant)>,
    rng: StdRng,
    advances: usize,
}

impl ReplaySource {
    pub fn new(fixture: ReplayFixture) -> Self {
        let rng = StdRng::seed_from_u64(fixture.seed);
        Self {
            current: fixture.start_page,
            shown_at: Instant::now(),
            pending: None,
            rng,
            advances: 0,
            fixture,
        }
    }

    pub fn fixture(&self) -> &ReplayFixture {
        &self.fixture
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Advances triggered so far.
    pub fn advances(&self) -> usize {
        self.advances
    }

    fn delay(&mut self, base_ms: u64) -> Duration {
        let jitter = if self.fixture.jitter_ms > 0 {
            self.rng.gen_range(0..=self.fixture.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base_ms + jitter)
    }

    /// Apply a pending page change once its time has come.
    fn settle(&mut self) {
        if let Some((target, at)) = self.pending {
            if Instant::now() >= at {
                debug!(from = self.current, to = target, "replay page shown");
                self.current = target;
                self.shown_at = at;
                self.pending = None;
            }
        }
    }

    fn rendered(&self) -> bool {
        self.shown_at.elapsed() >= Duration::from_millis(self.fixture.render_delay_ms)
    }
}

#[async_trait]
impl DataSource for ReplaySource {
    type Row = ReplayRow;

    async fn visible_rows(&mut self) -> Result<Vec<ReplayRow>, SourceError> {
        self.settle();
        let page = &self.fixture.pages[self.current];
        if let Some(message) = &page.error {
            return Err(SourceError::Protocol(message.clone()));
        }
        let rendered = self.rendered();
        let rows = page
            .rows
            .iter()
            .filter(|r| r.is_countable())
            .map(|r| {
                let mut row = r.clone();
                if !rendered {
                    row.cells.iter_mut().for_each(String::clear);
                }
                row
            })
            .collect();
        Ok(rows)
    }

    async fn column_index(&mut self, label: &str) -> Result<usize, SourceError> {
        self.settle();
        let headers = self.fixture.pages[self.current]
            .headers
            .as_deref()
            .unwrap_or(self.fixture.headers.as_slice());
        resolve_column(headers, label).ok_or_else(|| SourceError::ColumnNotFound {
            label: label.to_string(),
        })
    }

    fn read_cell(&self, row: &ReplayRow, column: usize) -> String {
        row.cells
            .get(column)
            .map(|c| c.trim().to_string())
            .unwrap_or_default()
    }

    fn row_keys(&self, row: &ReplayRow) -> RowKeys {
        RowKeys {
            attributes: row
                .id
                .iter()
                .map(|id| ("data-id".to_string(), id.clone()))
                .collect(),
            link: row.link.clone(),
            cells: row.cells.clone(),
        }
    }

    async fn page_identity(&mut self) -> Result<String, SourceError> {
        self.settle();
        Ok(self.fixture.location_of(self.current))
    }

    async fn page_number(&mut self) -> Result<Option<u32>, SourceError> {
        self.settle();
        Ok(self.fixture.pages[self.current].number)
    }

    async fn is_advance_available(&mut self) -> Result<bool, SourceError> {
        self.settle();
        Ok(self.fixture.next_of(self.current).is_some())
    }

    async fn trigger_advance(&mut self) -> Result<(), SourceError> {
        self.settle();
        let target = self
            .fixture
            .next_of(self.current)
            .ok_or_else(|| SourceError::ControlNotFound {
                control: "next".into(),
            })?;
        let delay = self.delay(self.fixture.transition_delay_ms);
        self.pending = Some((target, Instant::now() + delay));
        self.advances += 1;
        debug!(target, delay_ms = delay.as_millis() as u64, "replay advance scheduled");
        Ok(())
    }

    async fn force_first_page(&mut self) -> Result<(), SourceError> {
        self.pending = None;
        if self.current != 0 {
            self.current = 0;
            self.shown_at = Instant::now();
        }
        Ok(())
    }
}
