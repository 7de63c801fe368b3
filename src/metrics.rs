// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

fn int_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

// -------- Agent loop --------
pub static CYCLES: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("agent_cycles_total", "completed agent cycles", &["agent"]));

pub static CYCLE_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("agent_cycle_errors_total", "failed agent cycles (labels: agent, kind)", &["agent", "kind"]));

// Cycle wall time (milliseconds)
pub static CYCLE_MS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("agent_cycle_ms", "agent cycle duration (ms)")
            .buckets(vec![5.0, 25.0, 100.0, 250.0, 1000.0, 5000.0, 30000.0]),
        &["agent"],
    )
    .expect("static metric definition")
});

// -------- Decisions --------
pub static DECISIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("confluence_decisions_total", "confluence results (labels: profile, direction)", &["profile", "direction"]));

pub static REJECTIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("rejections_total", "risk / ledger rejections by reason", &["reason"]));

pub static TRADES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("trades_total", "ledger fills (labels: side, reason)", &["side", "reason"]));

pub static IMBALANCE: Lazy<GaugeVec> = Lazy::new(|| gauge_vec("orderflow_imbalance_ratio", "last bid/ask imbalance", &["symbol"]));

// -------- Account --------
pub static BALANCE: Lazy<GaugeVec> = Lazy::new(|| gauge_vec("account_balance", "cash balance per agent", &["agent"]));

pub static PNL_REALIZED: Lazy<GaugeVec> = Lazy::new(|| gauge_vec("pnl_realized", "realized PnL per agent", &["agent"]));

pub static OPEN_POSITIONS: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("open_positions", "open positions per agent", &["agent"]));

// ---- Config visibility (feed / mode / strategy / symbols) ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_feed_mode", "feed mode (label: mode)", &["mode"]));

pub static CONFIG_RUN_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_run_mode", "run mode (label: mode)", &["mode"]));

pub static CONFIG_STRATEGY: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_strategy_active", "active profile (label: strategy) value = agents", &["strategy"]));

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_symbol", "configured symbols (label: symbol)", &["symbol"]));

pub fn init() {
    // Register all metrics to the custom registry; re-registration is ignored
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CYCLES.clone()),
        Box::new(CYCLE_ERRORS.clone()),
        Box::new(CYCLE_MS.clone()),
        Box::new(DECISIONS.clone()),
        Box::new(REJECTIONS.clone()),
        Box::new(TRADES.clone()),
        Box::new(IMBALANCE.clone()),
        Box::new(BALANCE.clone()),
        Box::new(PNL_REALIZED.clone()),
        Box::new(OPEN_POSITIONS.clone()),
        Box::new(CONFIG_FEED_MODE.clone()),
        Box::new(CONFIG_RUN_MODE.clone()),
        Box::new(CONFIG_STRATEGY.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        let _ = REGISTRY.register(c);
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
async fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut req_buf = [0u8; 1024];
    let _ = stream.read(&mut req_buf).await;

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes()).await;
    let _ = stream.write_all(&body).await;
    let _ = stream.flush().await;
}

/// Runs until the process exits. A bind failure only disables metrics.
pub async fn serve_metrics(port: u16) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, %e, "metrics bind failed, exporter disabled");
            return;
        }
    };
    info!("metrics listening on http://{addr}/ (and /metrics)");
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_client(stream));
            }
            Err(e) => warn!(%e, "metrics accept error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_exported() {
        init();
        init();
        DECISIONS.with_label_values(&["test_profile", "long"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("confluence_decisions_total"));
        assert!(text.contains("test_profile"));
    }
}
