//! Capability set the traversal core needs from a paginated list view.
//!
//! The host UI is treated as an opaque oracle: the core samples it through
//! [`DataSource`] and never assumes a completion event exists. Rows are
//! captured per call and are never live; a fresh call re-reads the view.

pub mod lookup;
pub mod replay;
pub mod webdriver;

pub use lookup::{resolve_column, HeaderCell};
pub use replay::{ReplayFixture, ReplayRow, ReplaySource};
pub use webdriver::{WebDriverClient, WebDriverSource};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by a [`DataSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("column \"{label}\" not found; make sure it is visible in the list view")]
    ColumnNotFound { label: String },

    #[error("control \"{control}\" not found")]
    ControlNotFound { control: String },

    /// The view could not be sampled right now (mid re-render, stale handle).
    #[error("source temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fixture error: {0}")]
    Fixture(String),
}

impl SourceError {
    /// Transient failures are retried by polling loops within their budget.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Unavailable(_) => true,
            SourceError::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Identity material a row exposes, consumed by row signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKeys {
    /// Attribute name/value pairs carried by the row element.
    #[serde(default)]
    pub attributes: Vec<(String, String)>,

    /// Link to the underlying record, if the row has one.
    #[serde(default)]
    pub link: Option<String>,

    /// Display text of every cell, in column order.
    #[serde(default)]
    pub cells: Vec<String>,
}

impl RowKeys {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A paginated, asynchronously rendered list of records.
///
/// Implementations must only return rows that are actually visible
/// (hidden or cell-less rows are excluded) and must preserve display order.
#[async_trait]
pub trait DataSource: Send {
    /// Captured row handle. Reading it never touches the view again.
    type Row: Send + Sync;

    async fn visible_rows(&mut self) -> Result<Vec<Self::Row>, SourceError>;

    /// Zero-based column index for a visible header label.
    async fn column_index(&mut self, label: &str) -> Result<usize, SourceError>;

    fn read_cell(&self, row: &Self::Row, column: usize) -> String;

    fn row_keys(&self, row: &Self::Row) -> RowKeys;

    /// Location-like token for the page currently shown.
    async fn page_identity(&mut self) -> Result<String, SourceError>;

    async fn page_number(&mut self) -> Result<Option<u32>, SourceError>;

    async fn is_advance_available(&mut self) -> Result<bool, SourceError>;

    /// Fire-and-forget; the effect is observed by polling.
    async fn trigger_advance(&mut self) -> Result<(), SourceError>;

    async fn force_first_page(&mut self) -> Result<(), SourceError>;
}
