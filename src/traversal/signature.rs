use crate::source::{DataSource, RowKeys};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Row attributes that carry a stable record id, in precedence order.
pub const ID_ATTRIBUTES: [&str; 8] = [
    "data-id",
    "data-value",
    "data-rowid",
    "rowid",
    "data-rid",
    "data-lyte-id",
    "cxeid",
    "id",
];

/// Characters of the sampled column value kept in a page snapshot.
const SAMPLE_CHARS: usize = 120;

type SignatureStrategy = fn(&RowKeys) -> Option<String>;

const SIGNATURE_STRATEGIES: [SignatureStrategy; 3] = [by_id_attribute, by_link, by_content];

fn by_id_attribute(keys: &RowKeys) -> Option<String> {
    ID_ATTRIBUTES.iter().find_map(|name| {
        keys.attribute(name)
            .filter(|v| !v.trim().is_empty())
            .map(|v| format!("{}:{}", name, v))
    })
}

fn by_link(keys: &RowKeys) -> Option<String> {
    keys.link
        .as_deref()
        .filter(|href| !href.trim().is_empty())
        .map(|href| format!("href:{}", href))
}

fn by_content(keys: &RowKeys) -> Option<String> {
    if keys.cells.iter().all(|c| c.trim().is_empty()) {
        return None;
    }
    let mut hasher = Sha256::new();
    for cell in &keys.cells {
        hasher.update(cell.trim().as_bytes());
        hasher.update([0x1f]);
    }
    Some(format!("text:{}", hex::encode(hasher.finalize())))
}

/// Stable identity for a row, or an empty string when nothing identifies it.
///
/// Identifier attributes win, then the record link, then a hash of all cell text.
pub fn row_signature(keys: &RowKeys) -> String {
    SIGNATURE_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(keys))
        .unwrap_or_default()
}

/// Boundary sample of a page, used to tell whether content changed between polls.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub row_count: usize,
    pub boundary_sample: String,
    pub captured_at: Instant,
}

impl PartialEq for PageSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.boundary_sample == other.boundary_sample
    }
}

impl Eq for PageSnapshot {}

impl PageSnapshot {
    /// Derive a snapshot from captured rows.
    ///
    /// The sample is `count|first|middle|last|value` where first/middle/last are
    /// row signatures (middle only with more than two rows) and value is the
    /// first row's text in `column`. An empty page yields an empty sample.
    pub fn capture<S: DataSource + ?Sized>(source: &S, rows: &[S::Row], column: Option<usize>) -> Self {
        let captured_at = Instant::now();
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Self {
                row_count: 0,
                boundary_sample: String::new(),
                captured_at,
            };
        };

        let sig = |row: &S::Row| row_signature(&source.row_keys(row));
        let middle = if rows.len() > 2 {
            sig(&rows[rows.len() / 2])
        } else {
            String::new()
        };
        let value: String = column
            .map(|c| source.read_cell(first, c).chars().take(SAMPLE_CHARS).collect())
            .unwrap_or_default();

        Self {
            row_count: rows.len(),
            boundary_sample: format!("{}|{}|{}|{}|{}", rows.len(), sig(first), middle, sig(last), value),
            captured_at,
        }
    }

    pub fn signature(&self) -> &str {
        &self.boundary_sample
    }

    pub fn is_empty(&self) -> bool {
        self.boundary_sample.is_empty()
    }
}
