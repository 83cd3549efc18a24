use chrono::NaiveDateTime;
use clap::Parser;
use page_tally::report::{print_outcome, print_summary, run_with_progress, write_csv};
use page_tally::traversal::{Clock, FilterMode};
use page_tally::utils::{init_from_config, init_logger, Config};
use page_tally::{ReplayFixture, ReplaySource, TallyMetrics, TraversalController};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

/// Replay a recorded list view from a JSON fixture and tally it offline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fixture file
    #[arg(short, long, default_value = "fixtures/leads.json")]
    fixture: PathBuf,

    /// Config file (defaults to $CONFIG_FILE or config/default.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Period filter: all, this, last
    #[arg(short, long)]
    mode: Option<FilterMode>,

    /// Pin "now" for period windows (YYYY-MM-DD HH:MM:SS)
    #[arg(long)]
    now: Option<String>,

    /// Override the fixture's random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Write the CSV export
    #[arg(long)]
    csv: bool,

    /// Print Prometheus metrics at the end
    #[arg(long)]
    metrics: bool,

    /// Log level; overrides the configured logging
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    match &args.log_level {
        Some(level) => init_logger(level, false, None)?,
        None => init_from_config(&config.logging)?,
    }
    let mode = args.mode.unwrap_or(config.filter.mode);
    let clock = match &args.now {
        Some(raw) => Clock::Fixed(NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")?),
        None => Clock::System,
    };

    let mut fixture = ReplayFixture::from_file(&args.fixture)?;
    if let Some(seed) = args.seed {
        fixture.seed = seed;
    }

    println!("╔════════════════════════════════════════════════╗");
    println!("║         PAGE TALLY - REPLAY                    ║");
    println!("╚════════════════════════════════════════════════╝");
    println!();
    println!("Fixture: {}", args.fixture.display());
    println!("Pages: {}  Rows: {}", fixture.pages.len(), fixture.row_count());
    println!("Filter: {}", mode.label(config.filter.period));
    println!();

    let metrics = Arc::new(TallyMetrics::new()?);
    let mut controller = TraversalController::new(ReplaySource::new(fixture), config.traversal_settings(clock))
        .with_metrics(Arc::clone(&metrics));

    let run = run_with_progress(&mut controller, mode).await;
    match &run {
        Ok(outcome) => print_outcome(outcome),
        Err(e) => {
            error!("replay failed: {}", e);
            println!("\n✗ Replay failed: {}", e);
            println!("Counts below are partial.");
        }
    }
    print_summary(controller.aggregation(), &mode.label(config.filter.period));

    if args.csv {
        let path = write_csv(
            &config.report.output_dir,
            mode,
            controller.aggregation(),
            &config.report.csv_options(),
        )?;
        println!("CSV saved to: {}", path.display());
    }

    if args.metrics {
        println!("{}", metrics.render()?);
    }

    run?;
    Ok(())
}
