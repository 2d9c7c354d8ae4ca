use clap::{Parser, Subcommand};
use convo_ledger::sheets::{worksheet_title, MemoryStore, RowStore, SheetsClient};
use convo_ledger::{telemetry, RetryPolicy};
use convo_ledger_cli::commands::{inspect, load_config, record, recover};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "convo-record")]
#[command(about = "Durable recorder for voice-dialogue sessions", long_about = None)]
struct Cli {
    /// JSON config file. LEDGER_* environment variables override it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Local log path (overrides config)
    #[arg(long, global = true)]
    log_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a session from a dialogue script on stdin.
    /// Lines look like `user: ...`, `agent: ...` or `note: ...`.
    Record {
        /// Call id; names the worksheet `Call_<id>`
        #[arg(long)]
        call_id: Option<String>,

        /// Export to an in-memory store instead of the spreadsheet
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the local log, the overflow record and the last events
    Inspect {
        /// Number of trailing events to list
        #[arg(long, short, default_value_t = 10)]
        last: usize,
    },
    /// Re-export overflowed events to the spreadsheet
    Recover {
        /// Call id of the session being recovered
        #[arg(long)]
        call_id: String,

        /// Send to an in-memory store (checks the overflow file only)
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_telemetry()?;
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Record { call_id, dry_run } => {
            let config = load_config(cli.config, cli.log_path, call_id)?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let outcome = record::run(&config, dry_run, stdin).await?;

            println!("reason: {}", outcome.report.reason);
            println!("events: {}", outcome.events);
            for r in &outcome.report.results {
                println!(
                    "{:>6}: cursor {} written {} unexported {} overflowed {} rejected {}",
                    r.sink, r.cursor, r.written, r.unexported, r.overflowed, r.rejected
                );
            }
            if let Some(rows) = outcome.dry_run_rows {
                println!("dry run: {rows} rows held in memory");
            }
            if outcome.report.is_complete() {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "some events were not exported or were rejected, see {}",
                    config.overflow_path().display()
                ))
            }
        }
        Commands::Inspect { last } => {
            let config = load_config(cli.config, cli.log_path, None)?;
            inspect::run(&config.log_path, &config.overflow_path(), last).map(|_| ())
        }
        Commands::Recover { call_id, dry_run } => {
            let config = load_config(cli.config, cli.log_path, Some(call_id.clone()))?;
            let store: Arc<dyn RowStore> = if dry_run {
                Arc::new(MemoryStore::new())
            } else {
                let Some((id, token)) = config.sheets_credentials() else {
                    anyhow::bail!("recover needs spreadsheet_id and sheets_token");
                };
                Arc::new(SheetsClient::new(&config.sheets_endpoint, id, token, config.request_timeout())?)
            };
            recover::run(
                &config.overflow_path(),
                store,
                &worksheet_title(&call_id),
                config.batch_size,
                RetryPolicy::from(&config.retry),
            )
            .await
            .map(|_| ())
        }
    };

    tracing::debug!(metrics = %telemetry::render_metrics(), "Final metrics");
    result
}
