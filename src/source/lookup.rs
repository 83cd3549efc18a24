use serde::{Deserialize, Serialize};

/// Header cell as exposed by a list view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderCell {
    /// Visible header text
    pub label: String,

    /// Stable identifier attribute (e.g. a QA/test id), if any
    #[serde(default)]
    pub attribute: Option<String>,

    /// Explicit zero-based column index advertised by the header, if any
    #[serde(default)]
    pub column: Option<usize>,
}

impl HeaderCell {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            attribute: None,
            column: None,
        }
    }
}

/// Finds the header position matching a label, or `None`.
pub type HeaderMatcher = fn(&[HeaderCell], &str) -> Option<usize>;

/// Header matchers in precedence order.
pub const HEADER_MATCHERS: [(&str, HeaderMatcher); 2] = [
    ("attribute", match_by_attribute),
    ("text", match_by_text),
];

/// Exact match on the identifier attribute.
pub fn match_by_attribute(headers: &[HeaderCell], label: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.attribute.as_deref() == Some(label))
}

/// Case-insensitive match on trimmed header text.
pub fn match_by_text(headers: &[HeaderCell], label: &str) -> Option<usize> {
    let wanted = label.trim().to_lowercase();
    headers
        .iter()
        .position(|h| h.label.trim().to_lowercase() == wanted)
}

/// Resolve a label to a column index.
///
/// The header is located by the first matcher that succeeds; its index is the
/// advertised column when present, otherwise its position among the headers.
pub fn resolve_column(headers: &[HeaderCell], label: &str) -> Option<usize> {
    let (strategy, position) = HEADER_MATCHERS
        .iter()
        .find_map(|(name, matcher)| matcher(headers, label).map(|p| (*name, p)))?;

    let column = headers[position].column.unwrap_or(position);
    tracing::debug!(label, strategy, column, "resolved column");
    Some(column)
}
