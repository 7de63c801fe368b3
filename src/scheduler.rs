// ===============================
// src/scheduler.rs
// ===============================
//
// Multi mode   : one agent per target symbol, each with its own ledger and
//                total_capital / N. Agents share only the read-only config.
// Scanner mode : one agent over the universe shortlist, one shared ledger
//                capped at MAX_OPEN_POSITIONS.
//
// The scheduler owns no trading state; it spawns, waits for shutdown, and
// collects the ledgers back.
//
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::agent::{Agent, AgentDeps, Watchlist};
use crate::config::{RunMode, Settings};
use crate::domain::Symbol;
use crate::feed::DataError;
use crate::positions::PositionLedger;
use crate::scanner::{self, SurgeFilter};

pub struct AgentScheduler {
    cfg: Arc<Settings>,
    deps: AgentDeps,
}

impl AgentScheduler {
    pub fn new(cfg: Arc<Settings>, deps: AgentDeps) -> Self {
        Self { cfg, deps }
    }

    /// Multi mode: the configured symbols, or the top-N most liquid names of
    /// the universe when liquidity selection is on. Scanner mode: the universe
    /// the scanner agent will shortlist from.
    pub async fn targets(&self) -> Result<Vec<Symbol>, DataError> {
        if self.cfg.run_mode == RunMode::Scanner {
            Ok(self.cfg.scan_universe().to_vec())
        } else if self.cfg.select_by_liquidity {
            let universe = self.cfg.scan_universe();
            scanner::top_liquid(self.deps.sources.feed.as_ref(), universe, self.cfg.top_n).await
        } else {
            Ok(self.cfg.symbols.clone())
        }
    }

    pub fn build_agents(&self, targets: &[Symbol]) -> Vec<Agent> {
        match self.cfg.run_mode {
            RunMode::Multi => {
                if targets.is_empty() {
                    return Vec::new();
                }
                let capital = self.cfg.total_capital / Decimal::from(targets.len() as u64);
                targets
                    .iter()
                    .map(|sym| {
                        let ledger = PositionLedger::new(capital, self.cfg.ledger_config(1));
                        Agent::new(
                            format!("agent-{sym}"),
                            Watchlist::Symbols(vec![sym.clone()]),
                            ledger,
                            self.deps.clone(),
                            self.cfg.clone(),
                        )
                    })
                    .collect()
            }
            RunMode::Scanner => {
                let ledger = PositionLedger::new(self.cfg.total_capital, self.cfg.ledger_config(self.cfg.max_open_positions));
                vec![Agent::new(
                    "scanner",
                    Watchlist::Scanner { universe: self.cfg.scan_universe().to_vec(), filter: SurgeFilter::default() },
                    ledger,
                    self.deps.clone(),
                    self.cfg.clone(),
                )]
            }
        }
    }

    /// Spawn every agent and wait for all of them to wind down after
    /// `shutdown` flips. Returns (agent id, final ledger) per agent that
    /// exited cleanly.
    pub async fn run(self, targets: &[Symbol], shutdown: watch::Receiver<bool>) -> Vec<(String, PositionLedger)> {
        let agents = self.build_agents(targets);
        info!(mode = self.cfg.run_mode.as_str(), agents = agents.len(), profile = self.cfg.profile.name(), "launching agents");

        let (ids, tasks): (Vec<String>, Vec<JoinHandle<PositionLedger>>) = agents
            .into_iter()
            .map(|a| (a.id().to_string(), tokio::spawn(a.run(shutdown.clone()))))
            .unzip();
        drop(shutdown);

        let mut out = Vec::with_capacity(ids.len());
        for (id, joined) in ids.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(ledger) => {
                    info!(agent = %id, summary = %ledger.summary(), "agent joined");
                    out.push((id, ledger));
                }
                Err(e) => error!(agent = %id, ?e, "agent task failed"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Clock;
    use crate::config::{self, Cli};
    use crate::confluence::StrategyProfile;
    use crate::domain::TradeRecord;
    use crate::feed::SimulatedFeed;
    use crate::instrument::Underlying;
    use crate::oracle::Unconfigured;
    use crate::signals::SignalSources;
    use crate::testkit::{at, ManualClock};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn cfg(mode: RunMode, symbols: &[&str]) -> Settings {
        let mut s = config::from_lookup(&|_: &str| -> Option<String> { None }, &Cli::default()).unwrap();
        s.run_mode = mode;
        s.symbols = symbols.iter().map(|x| x.to_string()).collect();
        s.profile = StrategyProfile::OrderFlowImbalance;
        s.imbalance_threshold = 5.0;
        s.stop_loss_pct = dec!(0.5);
        s.take_profit_pct = dec!(1);
        s.total_capital = dec!(300000);
        s.cycle_interval = Duration::from_secs(60);
        s
    }

    fn deps(feed: Arc<SimulatedFeed>, clock: Arc<dyn Clock>) -> AgentDeps {
        AgentDeps {
            sources: SignalSources {
                feed,
                sentiment: Arc::new(Unconfigured),
                ml: Arc::new(Unconfigured),
                news: Arc::new(Unconfigured),
            },
            resolver: Arc::new(Underlying),
            clock,
            recorder: None,
        }
    }

    fn sim() -> Arc<SimulatedFeed> {
        Arc::new(SimulatedFeed::new(11, at(9, 15)))
    }

    #[test]
    fn multi_mode_splits_capital_evenly() {
        let c = Arc::new(cfg(RunMode::Multi, &["A", "B", "C"]));
        let s = AgentScheduler::new(c.clone(), deps(sim(), Arc::new(ManualClock::new(at(10, 0)))));
        let agents = s.build_agents(&c.symbols);
        assert_eq!(agents.len(), 3);
        for a in &agents {
            assert_eq!(a.ledger().balance(), dec!(100000));
        }
        assert_eq!(agents[1].id(), "agent-B");
    }

    #[test]
    fn scanner_mode_is_one_agent_with_the_full_account() {
        let c = Arc::new(cfg(RunMode::Scanner, &["A", "B", "C"]));
        let s = AgentScheduler::new(c.clone(), deps(sim(), Arc::new(ManualClock::new(at(10, 0)))));
        let agents = s.build_agents(&c.symbols);
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].ledger().balance(), dec!(300000));
    }

    /// Drive one agent through a trading day on its own clock.
    async fn trade_day(mut agent: Agent, clock: Arc<ManualClock>) -> Vec<TradeRecord> {
        for i in 0..80 {
            clock.set(at(9, 15) + ChronoDuration::minutes(5 * i));
            agent.run_cycle().await.unwrap();
        }
        agent.ledger().trade_log().to_vec()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_agents_match_isolated_runs() {
        let symbols = ["AAA", "BBB", "CCC", "DDD"];
        let c = Arc::new(cfg(RunMode::Multi, &symbols));

        // all agents at once, sharing one feed
        let shared = sim();
        let mut handles = Vec::new();
        for sym in symbols {
            let clock = Arc::new(ManualClock::new(at(9, 15)));
            let s = AgentScheduler::new(c.clone(), deps(shared.clone(), clock.clone()));
            let agent = s.build_agents(&c.symbols).into_iter().find(|a| a.id() == format!("agent-{sym}")).unwrap();
            handles.push((sym, tokio::spawn(trade_day(agent, clock))));
        }
        let mut together = Vec::new();
        for (sym, h) in handles {
            together.push((sym, h.await.unwrap()));
        }

        // each agent alone, with a fresh feed
        let mut traded = 0;
        for (sym, log) in together {
            let clock = Arc::new(ManualClock::new(at(9, 15)));
            let s = AgentScheduler::new(c.clone(), deps(sim(), clock.clone()));
            let agent = s.build_agents(&c.symbols).into_iter().find(|a| a.id() == format!("agent-{sym}")).unwrap();
            let alone = trade_day(agent, clock).await;
            assert_eq!(log, alone, "{sym}");
            assert!(log.iter().all(|t| t.symbol == sym));
            traded += log.len();
        }
        assert!(traded > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_joins_every_agent_on_shutdown() {
        let c = Arc::new(cfg(RunMode::Multi, &["A", "B"]));
        let s = AgentScheduler::new(c.clone(), deps(sim(), Arc::new(ManualClock::new(at(10, 0)))));
        let targets = s.targets().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let h = tokio::spawn(async move { s.run(&targets, rx).await });
        tokio::time::sleep(Duration::from_secs(600)).await;
        tx.send(true).unwrap();
        let ledgers = h.await.unwrap();
        assert_eq!(ledgers.len(), 2);
        for (_, l) in &ledgers {
            let s = l.summary();
            assert!(s.balance >= Decimal::ZERO);
            assert_eq!(s.initial_balance, dec!(150000));
        }
    }

    #[tokio::test]
    async fn scanner_targets_come_from_the_universe() {
        let mut c = cfg(RunMode::Scanner, &[]);
        c.universe = vec!["U1".into(), "U2".into()];
        let s = AgentScheduler::new(Arc::new(c), deps(sim(), Arc::new(ManualClock::new(at(10, 0)))));
        let t = s.targets().await.unwrap();
        assert_eq!(t, vec!["U1".to_string(), "U2".to_string()]);
        assert_eq!(s.build_agents(&t).len(), 1);
    }

    #[tokio::test]
    async fn liquidity_selection_picks_top_n() {
        let mut c = cfg(RunMode::Multi, &["A"]);
        c.universe = vec!["U1".into(), "U2".into(), "U3".into()];
        c.select_by_liquidity = true;
        c.top_n = 2;
        let s = AgentScheduler::new(Arc::new(c), deps(sim(), Arc::new(ManualClock::new(at(10, 0)))));
        let t = s.targets().await.unwrap();
        assert_eq!(t.len(), 2);
        assert!(t.iter().all(|x| x.starts_with('U')));
    }
}
