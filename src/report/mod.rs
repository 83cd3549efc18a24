pub mod csv;
pub mod summary;

pub use csv::{csv_file_name, render_csv, write_csv, CsvOptions};
pub use summary::{print_outcome, print_summary, run_with_progress, status_line};
