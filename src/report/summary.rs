use crate::source::{DataSource, SourceError};
use crate::traversal::{
    AggregationState, FilterMode, TraversalController, TraversalEvent, TraversalOutcome,
};

/// Categories listed in the terminal summary before truncating.
const MAX_ROWS: usize = 20;

/// One-line progress text for an event, if it carries any.
pub fn status_line(event: &TraversalEvent) -> Option<String> {
    match event {
        TraversalEvent::PageScanned { page, status, .. } => Some(format!("[page {}] {}", page, status)),
        TraversalEvent::Finished(outcome) => Some(format!(
            "{} ({} pages, total {})",
            outcome.reason, outcome.pages_scanned, outcome.total
        )),
        TraversalEvent::Failed(message) => Some(format!("Error: {}", message)),
        TraversalEvent::StateChanged(_) => None,
    }
}

/// Run a full traversal, printing a status line per page as it goes.
pub async fn run_with_progress<S: DataSource>(
    controller: &mut TraversalController<S>,
    mode: FilterMode,
) -> Result<TraversalOutcome, SourceError> {
    let mut events = controller.subscribe();
    let progress = async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = status_line(&event) {
                println!("{}", line);
            }
            if event.is_terminal() {
                break;
            }
        }
    };
    let (outcome, ()) = tokio::join!(controller.start_traversal(mode), progress);
    outcome
}

pub fn print_outcome(outcome: &TraversalOutcome) {
    println!("\n╔════════════════════════════════════════════════╗");
    println!("║         TRAVERSAL RESULT                       ║");
    println!("╠════════════════════════════════════════════════╣");
    println!("║ Status: {:<38} ║", if outcome.done { "done" } else { "aborted" });
    println!("║ Reason: {:<38} ║", truncate(&outcome.reason, 38));
    println!("║ Pages Scanned: {:<31} ║", outcome.pages_scanned);
    println!("║ Advances: {:<36} ║", outcome.advances);
    println!("╚════════════════════════════════════════════════╝");
}

pub fn print_summary(state: &AggregationState, period_label: &str) {
    println!("\n╔════════════════════════════════════════════════╗");
    println!("║         CATEGORY COUNTS                        ║");
    println!("╠════════════════════════════════════════════════╣");
    println!("║ Period: {:<38} ║", truncate(period_label, 38));
    println!("║ Rows Seen: {:<35} ║", state.seen_rows());
    println!("║ Pages Seen: {:<34} ║", state.seen_pages());
    println!("╠════════════════════════════════════════════════╣");

    let sorted = state.sorted_counts();
    if sorted.is_empty() {
        println!("║ {:<46} ║", "(no rows counted)");
    }
    for (category, count) in sorted.iter().take(MAX_ROWS) {
        println!("║ {:<38} {:>7} ║", truncate(category, 38), count);
    }
    if sorted.len() > MAX_ROWS {
        println!("║ {:<46} ║", format!("... {} more", sorted.len() - MAX_ROWS));
    }

    println!("╠════════════════════════════════════════════════╣");
    println!("║ {:<38} {:>7} ║", "Total", state.total());
    println!("╚════════════════════════════════════════════════╝\n");
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}
