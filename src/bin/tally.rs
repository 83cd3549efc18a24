use clap::Parser;
use page_tally::report::{print_outcome, print_summary, run_with_progress, write_csv};
use page_tally::traversal::{Clock, FilterMode};
use page_tally::utils::{init_from_config, Config};
use page_tally::{AggregationState, TallyMetrics, TraversalController, WebDriverClient, WebDriverSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Count list rows by category across every page of a live list view
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to $CONFIG_FILE or config/default.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Period filter: all, this, last
    #[arg(short, long)]
    mode: Option<FilterMode>,

    /// WebDriver endpoint
    #[arg(long)]
    webdriver: Option<String>,

    /// Attach to an existing WebDriver session
    #[arg(long)]
    session: Option<String>,

    /// List view to open first
    #[arg(long)]
    url: Option<String>,

    /// Scan only the page currently shown
    #[arg(long)]
    current_page: bool,

    /// Do not write the CSV export
    #[arg(long)]
    no_csv: bool,

    /// Close the browser session when done
    #[arg(long)]
    close: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(endpoint) = args.webdriver {
        config.source.webdriver_url = endpoint;
    }
    if args.session.is_some() {
        config.source.session_id = args.session;
    }
    if args.url.is_some() {
        config.source.start_url = args.url;
    }
    let mode = args.mode.unwrap_or(config.filter.mode);

    init_from_config(&config.logging)?;

    println!("╔════════════════════════════════════════════════╗");
    println!("║         PAGE TALLY - LIVE                      ║");
    println!("╚════════════════════════════════════════════════╝");
    println!();
    println!("WebDriver: {}", config.source.webdriver_url);
    println!("Column: {} (by {})", config.columns.category, config.columns.timestamp);
    println!("Filter: {}", mode.label(config.filter.period));
    println!();

    let timeout = Duration::from_millis(config.source.request_timeout_ms);
    let client = match &config.source.session_id {
        Some(id) => WebDriverClient::attach(&config.source.webdriver_url, id, timeout)?,
        None => WebDriverClient::connect(&config.source.webdriver_url, timeout).await?,
    };
    info!("✓ WebDriver session: {}", client.session_id());

    if let Some(url) = &config.source.start_url {
        client.navigate(url).await?;
        info!("✓ Opened {}", url);
    }

    let source = WebDriverSource::new(
        client.clone(),
        config.source.selectors.clone(),
        config.source.first_page.clone(),
    );
    let metrics = Arc::new(TallyMetrics::new()?);
    let mut controller = TraversalController::new(source, config.traversal_settings(Clock::System))
        .with_metrics(Arc::clone(&metrics));

    let run = if args.current_page {
        controller.scan_current_page(mode).await.map(|report| {
            println!(
                "Counted {} rows on this page ({}). Total: {}",
                report.added,
                mode.label(config.filter.period),
                controller.aggregation().total()
            );
        })
    } else {
        run_with_progress(&mut controller, mode)
            .await
            .map(|outcome| print_outcome(&outcome))
    };
    if let Err(e) = &run {
        error!("traversal failed: {}", e);
        println!("\n✗ Traversal failed: {}", e);
        println!("Counts below are partial.");
    }

    // Partial counts are still worth keeping after a failure
    print_summary(controller.aggregation(), &mode.label(config.filter.period));
    let exported = export(&config, mode, controller.aggregation(), &metrics, !args.no_csv);

    if args.close {
        if let Err(e) = client.close().await {
            warn!("failed to close session: {}", e);
        }
    }

    run?;
    exported
}

fn export(
    config: &Config,
    mode: FilterMode,
    state: &AggregationState,
    metrics: &TallyMetrics,
    csv: bool,
) -> anyhow::Result<()> {
    if csv {
        let path = write_csv(&config.report.output_dir, mode, state, &config.report.csv_options())?;
        println!("CSV saved to: {}", path.display());
    }

    if config.metrics.enabled {
        let text = metrics.render()?;
        if config.metrics.output_path.is_empty() {
            println!("{}", text);
        } else {
            std::fs::write(&config.metrics.output_path, text)?;
            println!("Metrics saved to: {}", config.metrics.output_path);
        }
    }
    Ok(())
}
