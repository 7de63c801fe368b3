// ===============================
// src/main.rs
// ===============================
/*
 # jalankan 2 agent per-symbol dengan feed simulasi
 RUN_MODE=multi SYMBOLS=NSE:SBIN-EQ,NSE:TCS-EQ STRATEGY=orderflow_imbalance cargo run

 # scanner mode di universe
 cargo run -- --mode scanner --symbols NSE:SBIN-EQ,NSE:TCS-EQ,NSE:INFY-EQ --strategy equity_surge

 # keputusan & penolakan
 curl -s localhost:9898/metrics | grep -E '^(confluence_decisions_total|rejections_total|trades_total)'
*/
/*
=============================================================================
Project : confluence_bot_rust — intraday confluence trading agents in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one paper-trading agent per symbol (or one scanner agent over
          a universe), fusing regime / breakout / sentiment / ML / order-flow
          signals through a configurable confluence gate, sizing by fixed
          fractional risk, and enforcing SL / TP / end-of-day exits.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod orderflow;
mod strategy;
mod confluence;
mod oracle;
mod signals;
mod risk;
mod positions;
mod scanner;
mod instrument;
mod agent;
mod scheduler;
#[cfg(test)]
mod testkit;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentDeps, SystemClock};
use crate::config::{FeedMode, InstrumentMode, Settings, StartupError};
use crate::domain::Event;
use crate::feed::{HttpFeed, MarketData, SimulatedFeed, Timed};
use crate::instrument::{AtmOption, InstrumentResolver, Underlying};
use crate::oracle::{HttpNews, HttpOracle, MlOracle, NewsSource, SentimentOracle, Unconfigured};
use crate::scheduler::AgentScheduler;
use crate::signals::SignalSources;

async fn build_feed(cfg: &Settings) -> Result<Arc<dyn MarketData>, StartupError> {
    match cfg.feed_mode {
        FeedMode::Mock => {
            let start = agent::Clock::now(&SystemClock::new(cfg.session.tz));
            Ok(Arc::new(Timed::new(SimulatedFeed::new(cfg.sim_seed, start), cfg.data_timeout)))
        }
        FeedMode::Http => {
            let token = cfg.broker_access_token.as_deref().ok_or(StartupError::Missing("BROKER_ACCESS_TOKEN"))?;
            let feed = HttpFeed::connect(&cfg.broker_rest_url, token, cfg.data_timeout)
                .await
                .map_err(|e| StartupError::Session(e.to_string()))?;
            Ok(Arc::new(Timed::new(feed, cfg.data_timeout)))
        }
    }
}

fn build_sources(cfg: &Settings, feed: Arc<dyn MarketData>) -> SignalSources {
    let sentiment: Arc<dyn SentimentOracle> = match cfg.sentiment_url.as_deref().map(|u| HttpOracle::new(u, cfg.data_timeout)) {
        Some(Ok(o)) => Arc::new(o),
        Some(Err(e)) => {
            warn!(%e, "sentiment oracle unavailable, sentiment gate will stay closed");
            Arc::new(Unconfigured)
        }
        None => Arc::new(Unconfigured),
    };
    let ml: Arc<dyn MlOracle> = match cfg.ml_url.as_deref().map(|u| HttpOracle::new(u, cfg.data_timeout)) {
        Some(Ok(o)) => Arc::new(o),
        Some(Err(e)) => {
            warn!(%e, "ml oracle unavailable, ml gate will stay closed");
            Arc::new(Unconfigured)
        }
        None => Arc::new(Unconfigured),
    };
    let news: Arc<dyn NewsSource> = match cfg.news_url.as_deref().map(|u| HttpNews::new(u, cfg.data_timeout)) {
        Some(Ok(n)) => Arc::new(n),
        _ => Arc::new(Unconfigured),
    };
    SignalSources { feed, sentiment, ml, news }
}

fn export_config(cfg: &Settings, agents: usize) {
    metrics::CONFIG_FEED_MODE.with_label_values(&[cfg.feed_mode.as_str()]).set(1);
    metrics::CONFIG_RUN_MODE.with_label_values(&[cfg.run_mode.as_str()]).set(1);
    metrics::CONFIG_STRATEGY.with_label_values(&[cfg.profile.name()]).set(agents as i64);
    for s in &cfg.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cli = config::Cli::parse();
    let cfg = match config::load(&cli) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(%e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        mode = cfg.run_mode.as_str(),
        feed = cfg.feed_mode.as_str(),
        profile = cfg.profile.name(),
        symbols = ?cfg.symbols,
        universe = cfg.universe.len(),
        capital = %cfg.total_capital,
        risk_pct = %cfg.risk_percentage,
        max_open = cfg.max_open_positions,
        tz = %cfg.session.tz,
        "startup config"
    );

    // ---- Feed (session check is the only fatal runtime error) ----
    let feed = match build_feed(&cfg).await {
        Ok(f) => f,
        Err(e) => {
            error!(%e, "startup failed, no agent launched");
            return ExitCode::FAILURE;
        }
    };

    // ---- Recorder (optional) ----
    let (rec_tx, recorder_task) = match cfg.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            let task = tokio::spawn(async move {
                if let Err(e) = recorder::run(rx, path).await {
                    error!(%e, "recorder stopped");
                }
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    let resolver: Arc<dyn InstrumentResolver> = match cfg.instrument_mode {
        InstrumentMode::Underlying => Arc::new(Underlying),
        InstrumentMode::AtmOption => Arc::new(AtmOption::new(cfg.option_prefix.clone(), cfg.strike_step)),
    };
    let deps = AgentDeps {
        sources: build_sources(&cfg, feed),
        resolver,
        clock: Arc::new(SystemClock::new(cfg.session.tz)),
        recorder: rec_tx,
    };
    let scheduler = AgentScheduler::new(cfg.clone(), deps);

    let targets = match scheduler.targets().await {
        Ok(t) if !t.is_empty() => t,
        Ok(_) => {
            warn!("no targets selected, shutting down");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!(%e, "target selection failed");
            return ExitCode::FAILURE;
        }
    };
    let agent_count = match cfg.run_mode {
        config::RunMode::Multi => targets.len(),
        config::RunMode::Scanner => 1,
    };
    export_config(&cfg, agent_count);
    info!(?targets, "targets for today");

    // ---- Shutdown ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received, stopping agents"),
            Err(e) => error!(%e, "ctrl_c listener failed, stopping agents"),
        }
        let _ = shutdown_tx.send(true);
    });

    let ledgers = scheduler.run(&targets, shutdown_rx).await;
    for (id, ledger) in &ledgers {
        let s = ledger.summary();
        info!(agent = %id, "{s}");
    }

    // recorder drains once every sender (held by the agents) is gone
    if let Some(task) = recorder_task {
        let _ = task.await;
    }
    info!(agents = ledgers.len(), "all agents stopped");
    ExitCode::SUCCESS
}
