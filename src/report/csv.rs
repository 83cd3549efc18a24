//! Two-column tabular export of an [`AggregationState`].
//!
//! Shape: a header row `<category header>,Count`, one row per category by
//! descending count, then a `(total)` row. Every field is quoted and embedded
//! quotes are doubled.

use crate::traversal::{AggregationState, FilterMode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Label of the appended total row. Parenthesized like the blank category so
/// a real category named `Total` stays distinct.
pub const TOTAL_LABEL: &str = "(total)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvOptions {
    pub category_header: String,
    pub file_prefix: String,
    pub include_total: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            category_header: "Category".to_string(),
            file_prefix: "tally".to_string(),
            include_total: true,
        }
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn line(category: &str, count: u64) -> String {
    format!("{},{}", quote(category), quote(&count.to_string()))
}

pub fn render_csv(state: &AggregationState, options: &CsvOptions) -> String {
    let mut lines = vec![format!("{},{}", quote(&options.category_header), quote("Count"))];
    lines.extend(
        state
            .sorted_counts()
            .into_iter()
            .map(|(category, count)| line(category, count)),
    );
    if options.include_total {
        lines.push(line(TOTAL_LABEL, state.total()));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `{prefix}_{slug}.csv`, slug being `all`, `this` or `last`.
pub fn csv_file_name(prefix: &str, mode: FilterMode) -> String {
    format!("{}_{}.csv", prefix, mode.slug())
}

/// Write the export into `dir`, creating it if needed.
pub fn write_csv(
    dir: &Path,
    mode: FilterMode,
    state: &AggregationState,
    options: &CsvOptions,
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(csv_file_name(&options.file_prefix, mode));
    fs::write(&path, render_csv(state, options))?;
    info!(path = %path.display(), categories = state.counts().len(), "csv written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RowKeys;
    use crate::traversal::{DateRangeFilter, DeduplicatingAggregator};

    fn state(rows: &[(&str, &str)]) -> AggregationState {
        let mut agg = DeduplicatingAggregator::new(DateRangeFilter::all());
        agg.extract(
            rows,
            |r| RowKeys {
                attributes: vec![("data-id".into(), r.0.to_string())],
                ..Default::default()
            },
            |r| r.1.to_string(),
            |_| String::new(),
        );
        agg.state().clone()
    }

    #[test]
    fn test_render_sorted_quoted_with_total() {
        let s = state(&[("1", "fax2"), ("2", "fax1"), ("3", "fax1"), ("4", "say \"hi\"")]);
        let options = CsvOptions {
            category_header: "LeadType(Fax)".into(),
            ..Default::default()
        };
        assert_eq!(
            render_csv(&s, &options),
            "\"LeadType(Fax)\",\"Count\"\n\
             \"fax1\",\"2\"\n\
             \"fax2\",\"1\"\n\
             \"say \"\"hi\"\"\",\"1\"\n\
             \"(total)\",\"4\"\n"
        );
    }

    #[test]
    fn test_category_named_total_is_not_the_total_row() {
        let s = state(&[("1", "Total"), ("2", "Total"), ("3", "fax1")]);
        let csv = render_csv(&s, &CsvOptions::default());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[1], "\"Total\",\"2\"");
        assert_eq!(lines[3], "\"(total)\",\"3\"");
    }

    #[test]
    fn test_empty_state_without_total() {
        let options = CsvOptions {
            include_total: false,
            ..Default::default()
        };
        assert_eq!(
            render_csv(&AggregationState::default(), &options),
            "\"Category\",\"Count\"\n"
        );
    }

    #[test]
    fn test_file_name_per_mode() {
        assert_eq!(csv_file_name("lead_types_by_fax", FilterMode::All), "lead_types_by_fax_all.csv");
        assert_eq!(csv_file_name("t", FilterMode::CurrentPeriod), "t_this.csv");
        assert_eq!(csv_file_name("t", FilterMode::PreviousPeriod), "t_last.csv");
    }

    #[test]
    fn test_write_csv_creates_dir() {
        let dir = std::env::temp_dir().join(format!("page_tally_csv_{}", std::process::id()));
        let s = state(&[("1", "fax1")]);
        let path = write_csv(&dir, FilterMode::All, &s, &CsvOptions::default()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.ends_with("\"(total)\",\"1\"\n"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
