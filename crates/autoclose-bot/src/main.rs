//! Position auto-close service - Entry Point

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;

use autoclose_bot::config::DEFAULT_CONFIG_PATH;
use autoclose_bot::{AppConfig, Application};
use autoclose_core::{PositionKind, Price, Size, Symbol};
use autoclose_position::PaperExchange;

/// Position auto-close service
#[derive(Parser, Debug)]
#[command(name = "autoclose", version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via AUTOCLOSE_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore timers, then run the sweep and liquidation loops until Ctrl-C
    Run {
        /// Use the in-memory paper exchange
        #[arg(long)]
        paper: bool,
    },
    /// Print open positions, persisted timers and recent closes
    Status {
        /// One JSON object per line
        #[arg(long)]
        json: bool,
        /// Number of most recent closed positions to include
        #[arg(long, default_value_t = 10)]
        closed: usize,
    },
    /// Record an externally opened position and arm its hold timer
    Open {
        symbol: String,
        /// directional | leveraged_short
        #[arg(long, default_value = "directional")]
        kind: PositionKind,
        #[arg(long)]
        entry_price: Price,
        #[arg(long)]
        amount: Size,
        /// Defaults to monitor.default_leverage
        #[arg(long)]
        leverage: Option<Decimal>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Determine config path: CLI arg > AUTOCLOSE_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("AUTOCLOSE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = AppConfig::load(&config_path)?;
    autoclose_telemetry::init_logging(Some(&config.telemetry.log_level))?;

    info!(config_path = %config_path, "Starting autoclose v{}", env!("CARGO_PKG_VERSION"));

    // Every command records state through the same stores; only `run --paper`
    // talks to the exchange.
    let paper = Arc::new(PaperExchange::new());
    let app = Application::new(config, paper.clone())?;

    match args.command {
        Command::Run { paper: use_paper } => {
            if !use_paper {
                app.shutdown().await;
                bail!("no live exchange gateway is configured; start with `run --paper`");
            }
            for record in app.positions().list_open().await? {
                paper.seed_position(&record);
            }
            info!("Running against the paper exchange");
            app.run().await?;
        }
        Command::Status { json, closed } => {
            let status = app.status(closed).await?;
            for p in &status.open {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "id": p.id,
                            "symbol": p.symbol,
                            "kind": p.kind,
                            "entry_price": p.entry_price,
                            "entry_time": p.entry_time,
                            "amount": p.amount,
                            "leverage": p.leverage,
                        })
                    );
                } else {
                    println!(
                        "#{} {} {} entry={} amount={} leverage={} opened={}",
                        p.id, p.symbol, p.kind, p.entry_price, p.amount, p.leverage, p.entry_time
                    );
                }
            }
            for t in &status.timers {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "timer": t.symbol,
                            "started_at": t.started_at,
                            "elapsed_secs": t.elapsed.as_secs_f64(),
                        })
                    );
                } else {
                    println!(
                        "timer {} started={} elapsed={:.1}s",
                        t.symbol,
                        t.started_at,
                        t.elapsed.as_secs_f64()
                    );
                }
            }
            for p in &status.closed {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "closed": p.id,
                            "symbol": p.symbol,
                            "kind": p.kind,
                            "entry_price": p.entry_price,
                            "exit_price": p.exit_price,
                            "exit_time": p.exit_time,
                            "pnl_usd": p.pnl_usd,
                            "pnl_percent": p.pnl_percent,
                            "reason": p.reason,
                        })
                    );
                } else {
                    println!(
                        "closed #{} {} {} reason={} entry={} exit={} pnl={}%",
                        p.id,
                        p.symbol,
                        p.kind,
                        p.reason.map_or("-", |r| r.as_str()),
                        p.entry_price,
                        p.exit_price.map_or_else(|| "-".to_string(), |x| x.to_string()),
                        p.pnl_percent.map_or_else(|| "-".to_string(), |x| x.round_dp(2).to_string()),
                    );
                }
            }
            app.shutdown().await;
        }
        Command::Open {
            symbol,
            kind,
            entry_price,
            amount,
            leverage,
        } => {
            let symbol = Symbol::new(symbol)?;
            let id = app
                .open_position(&symbol, kind, entry_price, amount, leverage)
                .await;
            app.shutdown().await;
            println!("opened position #{} for {}", id?, symbol);
        }
    }

    Ok(())
}
