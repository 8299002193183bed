use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use smart_sitrep_etl::config::AppConfig;
use smart_sitrep_etl::models::SiteId;
use smart_sitrep_etl::pipeline::Pipeline;
use smart_sitrep_etl::planner::{WindowSpec, plan_windows};
use smart_sitrep_etl::storage::{DuckDbSink, Sink};
use smart_sitrep_etl::utils;

#[derive(Parser)]
#[command(name = "smart-etl", about = "SMART sitrep extract and idempotent load", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args)]
struct RangeArgs {
    /// Last report date to request: YYYY-MM-DD or `today`
    #[arg(long)]
    end: Option<String>,

    /// Look-back: a day count or "<N> day(s)|week(s)|month(s)|year(s)"
    #[arg(long)]
    window: Option<WindowSpec>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every window for every site and replace it in the sink
    Run {
        #[command(flatten)]
        range: RangeArgs,

        /// Site hash to extract; repeat for several (default: job.sites)
        #[arg(long = "site")]
        sites: Vec<String>,
    },

    /// Print the windows a run would request, without touching the API or sink
    Plan {
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Show sink table statistics
    Stats,
}

impl RangeArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(end) = self.end {
            config.job.date_end = end;
        }
        if let Some(window) = self.window {
            config.job.date_window = window;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "smart_sitrep_etl=info,warn",
        1 => "smart_sitrep_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Run { range, sites } => {
            range.apply(&mut config);
            if !sites.is_empty() {
                config.job.sites = sites.into_iter().map(SiteId::new).collect();
            }

            let _t = utils::Timer::start("SMART extract");
            config.validate_for_run()?;
            let windows = plan_windows(
                &config.job.date_end,
                &config.job.date_window,
                config.api.max_window_days,
            )?;

            let pipeline = Pipeline::from_config(&config).context("Failed to build pipeline")?;
            let stats = pipeline
                .execute(&windows, &config.job.sites)
                .await
                .inspect_err(|e| error!("Run aborted: {}", e))
                .context("SMART extract aborted")?;
            info!(
                "Done: {} windows, {} partitions, {} rows, {} requests",
                stats.windows_processed, stats.partitions_loaded, stats.rows_loaded, stats.requests
            );
        }

        Command::Plan { range } => {
            range.apply(&mut config);
            let windows = plan_windows(
                &config.job.date_end,
                &config.job.date_window,
                config.api.max_window_days,
            )?;
            println!("{} windows ({}):", windows.len(), config.job.date_window);
            for w in &windows {
                println!("  {}  →  {}  ({} days)", w.start, w.end, w.days());
            }
        }

        Command::Stats => {
            let repo = DuckDbSink::new(&config.sink).connect()?;
            let rows = repo.row_count()?;
            let (min, max) = repo.date_range()?;
            println!("─────────────────────────────────");
            println!("  SMART sitrep — Sink Stats");
            println!("─────────────────────────────────");
            println!("  Table : {}.{}", config.sink.schema, config.sink.table);
            println!("  Rows  : {}", utils::fmt_number(rows));
            println!("  From  : {}", min.unwrap_or_else(|| "—".into()));
            println!("  To    : {}", max.unwrap_or_else(|| "—".into()));
            println!("─────────────────────────────────");
        }
    }

    Ok(())
}
