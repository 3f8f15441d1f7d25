//! Scheduler: the single control loop that drives the engine.
//!
//! One spawned task multiplexes four jobs with `select!`:
//! - Risk tick (reprice + forced closes)
//! - Alert tick
//! - Hourly strategy tick at a fixed minute offset
//! - Live account reconciliation
//!
//! Jobs run one at a time inside the loop; a slow job delays the next tick.
//! Decision rounds are spawned and never awaited by the loop.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::QuoteSource;
use crate::db::{Database, TickColumn};
use crate::decision::{run_decision_round, DecisionMaker, DecisionTrigger, Notifier};
use crate::error::{EngineError, EngineResult};
use crate::gateway::GatewayFactory;
use crate::trading::{AlertMonitor, EngineConfig, PositionLedger, RiskEngine};

/// Everything a tick needs. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct EngineServices {
    pub config: EngineConfig,
    pub db: Database,
    pub ledger: PositionLedger,
    pub risk: RiskEngine,
    pub alerts: AlertMonitor,
    pub quotes: Arc<dyn QuoteSource>,
    pub gateways: Arc<GatewayFactory>,
    pub decision_maker: Arc<dyn DecisionMaker>,
    pub notifier: Arc<dyn Notifier>,
}

/// Counters from one risk tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskTickReport {
    pub positions: usize,
    pub priced: usize,
    pub closed: usize,
    pub already_closed: usize,
    pub failed: usize,
}

impl EngineServices {
    pub fn new(
        config: EngineConfig,
        db: Database,
        quotes: Arc<dyn QuoteSource>,
        decision_maker: Arc<dyn DecisionMaker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ledger = PositionLedger::new(db.clone(), &config);
        let gateways = Arc::new(GatewayFactory::new(
            ledger.clone(),
            quotes.clone(),
            &config.exchange_base_url,
        ));

        Self {
            alerts: AlertMonitor::new(db.clone()),
            risk: RiskEngine::new(),
            config,
            db,
            ledger,
            quotes,
            gateways,
            decision_maker,
            notifier,
        }
    }

    /// Reprice every open position from one price snapshot, then settle forced closes.
    pub async fn risk_tick(&self) -> EngineResult<RiskTickReport> {
        let positions = self.ledger.open_positions().await?;
        let mut report = RiskTickReport {
            positions: positions.len(),
            ..Default::default()
        };
        if positions.is_empty() {
            return Ok(report);
        }

        let symbols: Vec<String> = positions
            .iter()
            .map(|p| p.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let prices = self.quotes.batch_price(&symbols).await?;

        for position in &positions {
            let Some(price) = prices.get(&position.symbol) else {
                continue;
            };
            match self.ledger.reprice(position.id, *price).await {
                Ok(()) => report.priced += 1,
                Err(EngineError::PositionNotOpen(_)) => {}
                Err(e) => warn!(position_id = position.id, error = %e, "Reprice failed"),
            }
        }

        let snapshot = self.risk.snapshot(&positions, &prices);
        debug!(
            evaluated = snapshot.evaluated,
            skipped = snapshot.skipped_no_price,
            unrealized = %snapshot.unrealized_pnl,
            margin = %snapshot.margin_in_use,
            "Risk snapshot"
        );

        for decision in self.risk.evaluate(&positions, &prices) {
            match self
                .ledger
                .close(decision.position_id, decision.price, dec!(100), decision.reason)
                .await
            {
                Ok(outcome) => {
                    report.closed += 1;
                    info!(
                        position_id = decision.position_id,
                        symbol = %decision.symbol,
                        reason = %decision.reason,
                        price = %decision.price,
                        pnl = %outcome.realized_pnl,
                        "Forced close"
                    );
                }
                Err(EngineError::AlreadyClosed(id)) => {
                    report.already_closed += 1;
                    debug!(position_id = id, "Forced close raced with another close");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        position_id = decision.position_id,
                        error = %e,
                        category = e.category(),
                        "Forced close failed"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Trigger crossed alerts and hand each one to the decision layer.
    pub async fn alert_tick(&self) -> EngineResult<Vec<JoinHandle<()>>> {
        let symbols = self.alerts.pending_symbols().await?;
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let prices = self.quotes.batch_price(&symbols).await?;
        let triggered = self.alerts.check_all(&prices).await?;

        let mut handles = Vec::with_capacity(triggered.len());
        for alert in triggered {
            self.notifier.alert_triggered(&alert).await;
            let user_id = alert.user_id.clone();
            handles.push(self.spawn_decision(user_id, DecisionTrigger::Alert { alert }));
        }
        Ok(handles)
    }

    /// Start one decision round per strategy user.
    pub fn strategy_tick(&self) -> Vec<JoinHandle<()>> {
        self.config
            .strategy_users
            .iter()
            .map(|user| self.spawn_decision(user.clone(), DecisionTrigger::Hourly))
            .collect()
    }

    pub async fn reconcile_tick(&self) -> EngineResult<usize> {
        let reports = self.gateways.reconcile_all().await?;
        Ok(reports.len())
    }

    fn spawn_decision(&self, user_id: String, trigger: DecisionTrigger) -> JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            let label = trigger.label();
            let gateway = match services.gateways.for_user(&user_id).await {
                Ok(gateway) => gateway,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "No gateway for decision round");
                    return;
                }
            };

            if let Err(e) = run_decision_round(
                gateway.as_ref(),
                services.decision_maker.as_ref(),
                services.notifier.as_ref(),
                &services.config,
                trigger,
            )
            .await
            {
                warn!(user = %user_id, trigger = label, error = %e, "Decision round failed");
            }
        })
    }
}

// ==================== Jobs ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobKind {
    Risk,
    Alert,
    Strategy,
    Reconcile,
}

impl JobKind {
    const ALL: [JobKind; 4] = [JobKind::Risk, JobKind::Alert, JobKind::Strategy, JobKind::Reconcile];

    fn name(&self) -> &'static str {
        match self {
            JobKind::Risk => "risk_tick",
            JobKind::Alert => "alert_tick",
            JobKind::Strategy => "strategy_tick",
            JobKind::Reconcile => "reconcile_tick",
        }
    }

    fn column(&self) -> TickColumn {
        match self {
            JobKind::Risk => TickColumn::Risk,
            JobKind::Alert => TickColumn::Alert,
            JobKind::Strategy => TickColumn::Strategy,
            JobKind::Reconcile => TickColumn::Reconcile,
        }
    }
}

/// Per-job counters exposed through `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub schedule: String,
    pub last_run: Option<DateTime<Utc>>,
    pub runs: u64,
    pub failures: u64,
}

type JobRegistry = Arc<Mutex<HashMap<JobKind, JobStatus>>>;

fn register_jobs(config: &EngineConfig) -> JobRegistry {
    let jobs: HashMap<JobKind, JobStatus> = JobKind::ALL
        .iter()
        .map(|kind| {
            let schedule = match kind {
                JobKind::Risk => format!("every {}s", config.risk_interval_secs),
                JobKind::Alert => format!("every {}s", config.alert_interval_secs),
                JobKind::Strategy => format!("hourly at :{:02}", config.strategy_minute),
                JobKind::Reconcile => format!("every {}s", config.reconcile_interval_secs),
            };
            (
                *kind,
                JobStatus {
                    name: kind.name(),
                    schedule,
                    last_run: None,
                    runs: 0,
                    failures: 0,
                },
            )
        })
        .collect();
    Arc::new(Mutex::new(jobs))
}

/// Next wall-clock time strictly after `after` whose minute is `minute` and seconds are zero.
pub fn next_hourly_run(after: DateTime<Utc>, minute: u32) -> DateTime<Utc> {
    let hour_start = after.duration_trunc(ChronoDuration::hours(1)).unwrap_or(after);
    let candidate = hour_start + ChronoDuration::minutes(i64::from(minute.min(59)));
    if candidate > after {
        candidate
    } else {
        candidate + ChronoDuration::hours(1)
    }
}

// ==================== Scheduler ====================

/// Result of a start/stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResult {
    pub success: bool,
    pub message: String,
}

impl StartResult {
    fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobStatus>,
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    shutdown: Option<Arc<AtomicBool>>,
    wake: Option<Arc<Notify>>,
    handle: Option<JoinHandle<()>>,
    jobs: Option<JobRegistry>,
}

/// Owns the control loop lifecycle. Starts are serialized by `starting`; `state`
/// is only held for short sections so `status` and `stop` never wait on a tick.
pub struct Scheduler {
    services: EngineServices,
    starting: Mutex<()>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(services: EngineServices) -> Self {
        Self {
            services,
            starting: Mutex::new(()),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub async fn start(&self) -> StartResult {
        let _starting = self.starting.lock().await;
        let previous = {
            let mut state = self.state.lock().await;
            if state.running {
                return StartResult::rejected("already running");
            }
            state.handle.take()
        };

        // A previous loop may still be finishing its last tick
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous control loop ended abnormally");
            }
        }

        let mut state = self.state.lock().await;
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let jobs = register_jobs(&self.services.config);

        let handle = tokio::spawn(control_loop(
            self.services.clone(),
            shutdown.clone(),
            wake.clone(),
            jobs.clone(),
        ));

        state.running = true;
        state.started_at = Some(Utc::now());
        state.shutdown = Some(shutdown);
        state.wake = Some(wake);
        state.handle = Some(handle);
        state.jobs = Some(jobs);

        if let Err(e) = self.services.db.mark_scheduler_started().await {
            warn!(error = %e, "Failed to record scheduler start");
        }

        info!(
            risk_interval = self.services.config.risk_interval_secs,
            alert_interval = self.services.config.alert_interval_secs,
            strategy_minute = self.services.config.strategy_minute,
            "Scheduler started"
        );
        StartResult::ok("started")
    }

    /// Ask the loop to exit after its current tick. Does not wait for it.
    pub async fn stop(&self) -> StartResult {
        let mut state = self.state.lock().await;
        if !state.running {
            return StartResult::rejected("not running");
        }

        if let Some(shutdown) = state.shutdown.take() {
            shutdown.store(true, Ordering::SeqCst);
        }
        if let Some(wake) = state.wake.take() {
            wake.notify_one();
        }
        state.running = false;
        state.started_at = None;
        state.jobs = None;

        if let Err(e) = self.services.db.mark_scheduler_stopped().await {
            warn!(error = %e, "Failed to record scheduler stop");
        }

        info!("Scheduler stopping");
        StartResult::ok("stopped")
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().await;
        let jobs: Vec<JobStatus> = match &state.jobs {
            Some(registry) => {
                let registry = registry.lock().await;
                JobKind::ALL
                    .iter()
                    .filter_map(|kind| registry.get(kind).cloned())
                    .collect()
            }
            None => Vec::new(),
        };

        SchedulerStatus {
            running: state.running,
            started_at: state.started_at,
            jobs,
        }
    }

    /// Wait for the loop to exit after `stop()`.
    pub async fn join(&self) {
        let handle = self.state.lock().await.handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Control loop ended abnormally");
            }
        }
    }
}

async fn control_loop(
    services: EngineServices,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    jobs: JobRegistry,
) {
    let config = services.config.clone();

    let mut risk_timer = interval(Duration::from_secs(config.risk_interval_secs));
    let mut alert_timer = interval(Duration::from_secs(config.alert_interval_secs));
    let mut reconcile_timer = interval(Duration::from_secs(config.reconcile_interval_secs));
    for timer in [&mut risk_timer, &mut alert_timer, &mut reconcile_timer] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }
    let mut next_strategy = next_hourly_run(Utc::now(), config.strategy_minute);

    info!(next_strategy = %next_strategy, "Control loop running");

    while !shutdown.load(Ordering::SeqCst) {
        let until_strategy = (next_strategy - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;

            _ = wake.notified() => continue,

            _ = risk_timer.tick() => {
                let result = services.risk_tick().await.map(|report| {
                    if report.closed > 0 || report.failed > 0 {
                        info!(
                            positions = report.positions,
                            closed = report.closed,
                            failed = report.failed,
                            "Risk tick"
                        );
                    }
                });
                finish_job(&services, &jobs, JobKind::Risk, result).await;
            }

            _ = alert_timer.tick() => {
                let result = services.alert_tick().await.map(|handles| {
                    if !handles.is_empty() {
                        info!(triggered = handles.len(), "Alert tick");
                    }
                });
                finish_job(&services, &jobs, JobKind::Alert, result).await;
            }

            _ = sleep_until(Instant::now() + until_strategy) => {
                let spawned = services.strategy_tick();
                info!(users = spawned.len(), "Strategy tick dispatched");
                finish_job(&services, &jobs, JobKind::Strategy, Ok(())).await;
                next_strategy = next_hourly_run(next_strategy.max(Utc::now()), config.strategy_minute);
            }

            _ = reconcile_timer.tick() => {
                let result = services.reconcile_tick().await.map(|synced| {
                    if synced > 0 {
                        debug!(accounts = synced, "Reconcile tick");
                    }
                });
                finish_job(&services, &jobs, JobKind::Reconcile, result).await;
            }
        }
    }

    info!("Control loop stopped");
}

/// Record the job outcome. Errors are logged and never end the loop.
async fn finish_job(services: &EngineServices, jobs: &JobRegistry, kind: JobKind, result: EngineResult<()>) {
    let failed = match result {
        Ok(()) => false,
        Err(e) if e.is_transient() => {
            warn!(job = kind.name(), error = %e, "Job skipped this tick");
            true
        }
        Err(e) => {
            error!(job = kind.name(), error = %e, category = e.category(), "Job failed");
            true
        }
    };

    if let Some(status) = jobs.lock().await.get_mut(&kind) {
        status.runs += 1;
        status.last_run = Some(Utc::now());
        if failed {
            status.failures += 1;
        }
    }

    if let Err(e) = services.db.record_tick(kind.column()).await {
        debug!(job = kind.name(), error = %e, "Failed to record heartbeat");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticQuotes;
    use crate::decision::{HoldDecisionMaker, LogNotifier};
    use crate::models::{AlertCondition, AlertStatus, CloseReason, Direction, PositionStatus};
    use crate::trading::OpenRequest;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use tokio::sync::Semaphore;

    async fn services_with(config: EngineConfig) -> (EngineServices, Arc<StaticQuotes>) {
        let db = Database::in_memory().await.unwrap();
        let quotes = Arc::new(StaticQuotes::default());
        let services = EngineServices::new(
            config,
            db,
            quotes.clone(),
            Arc::new(HoldDecisionMaker),
            Arc::new(LogNotifier),
        );
        (services, quotes)
    }

    async fn services() -> (EngineServices, Arc<StaticQuotes>) {
        services_with(EngineConfig::default()).await
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            risk_interval_secs: 3600,
            alert_interval_secs: 3600,
            reconcile_interval_secs: 3600,
            ..EngineConfig::default()
        }
    }

    fn services_on(db: Database, config: EngineConfig, quotes: Arc<dyn QuoteSource>) -> EngineServices {
        EngineServices::new(config, db, quotes, Arc::new(HoldDecisionMaker), Arc::new(LogNotifier))
    }

    /// Quote feed that is down.
    struct FailingQuotes;

    #[async_trait]
    impl QuoteSource for FailingQuotes {
        async fn batch_price(&self, _symbols: &[String]) -> EngineResult<HashMap<String, Decimal>> {
            Err(EngineError::QuoteUnavailable("ticker endpoint timed out".into()))
        }
    }

    /// Closes one position by hand while the tick is fetching prices.
    struct ClosingQuotes {
        ledger: PositionLedger,
        position_id: i64,
        prices: HashMap<String, Decimal>,
    }

    #[async_trait]
    impl QuoteSource for ClosingQuotes {
        async fn batch_price(&self, _symbols: &[String]) -> EngineResult<HashMap<String, Decimal>> {
            self.ledger
                .close(self.position_id, dec!(50000), dec!(100), CloseReason::Manual)
                .await?;
            Ok(self.prices.clone())
        }
    }

    /// Blocks every quote request until the gate has a permit.
    struct GatedQuotes {
        entered: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl QuoteSource for GatedQuotes {
        async fn batch_price(&self, symbols: &[String]) -> EngineResult<HashMap<String, Decimal>> {
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| EngineError::QuoteUnavailable(e.to_string()))?;
            Ok(symbols.iter().map(|s| (s.clone(), dec!(50000))).collect())
        }
    }

    fn btc_long() -> OpenRequest {
        OpenRequest {
            user_id: "admin".to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            margin: dec!(1000),
            leverage: 10,
            entry_price: dec!(50000),
            stop_loss: Some(dec!(48000)),
            take_profit: None,
        }
    }

    #[test]
    fn test_next_hourly_run() {
        let at = |h, m, s| Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap();
        assert_eq!(next_hourly_run(at(9, 0, 0), 5), at(9, 5, 0));
        assert_eq!(next_hourly_run(at(9, 4, 59), 5), at(9, 5, 0));
        assert_eq!(next_hourly_run(at(9, 5, 0), 5), at(10, 5, 0));
        assert_eq!(next_hourly_run(at(9, 30, 0), 5), at(10, 5, 0));
        assert_eq!(
            next_hourly_run(at(23, 59, 0), 0),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (services, _) = services().await;
        let scheduler = Scheduler::new(services);

        assert_eq!(scheduler.start().await, StartResult::ok("started"));
        let second = scheduler.start().await;
        assert!(!second.success);
        assert_eq!(second.message, "already running");

        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.jobs.len(), 4);

        assert!(scheduler.stop().await.success);
        let again = scheduler.stop().await;
        assert!(!again.success);
        assert_eq!(again.message, "not running");

        let status = scheduler.status().await;
        assert!(!status.running);
        assert!(status.jobs.is_empty());
        scheduler.join().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_one_loop() {
        let (services, _) = services().await;
        let scheduler = Scheduler::new(services);

        let results = futures::future::join_all((0..5).map(|_| scheduler.start())).await;
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);

        scheduler.stop().await;
        scheduler.join().await;
        assert!(scheduler.start().await.success);
        scheduler.stop().await;
        scheduler.join().await;
    }

    #[tokio::test]
    async fn test_risk_tick_liquidates_before_stop_loss() {
        let (services, quotes) = services().await;
        let pos = services.ledger.open(btc_long()).await.unwrap();
        quotes.set("BTCUSDT", dec!(45000));

        let report = services.risk_tick().await.unwrap();
        assert_eq!(report.positions, 1);
        assert_eq!(report.priced, 1);
        assert_eq!(report.closed, 1);

        let closed = services.ledger.get_position(pos.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Liquidated);
        assert_eq!(closed.close_reason, Some(CloseReason::Liquidated));
        assert_eq!(services.ledger.ensure_wallet("admin").await.unwrap().current_balance, dec!(9000));
    }

    #[tokio::test]
    async fn test_risk_tick_skips_unpriced_symbols() {
        let (services, quotes) = services().await;
        let btc = services.ledger.open(btc_long()).await.unwrap();
        let mut eth = btc_long();
        eth.symbol = "ETHUSDT".to_string();
        eth.entry_price = dec!(2500);
        eth.stop_loss = None;
        let eth = services.ledger.open(eth).await.unwrap();

        quotes.set("ETHUSDT", dec!(2550));
        let report = services.risk_tick().await.unwrap();
        assert_eq!(report.priced, 1);
        assert_eq!(report.closed, 0);

        assert_eq!(services.ledger.get_position(eth.id).await.unwrap().unrealized_pnl, dec!(200));
        let untouched = services.ledger.get_position(btc.id).await.unwrap();
        assert_eq!(untouched.current_price, dec!(50000));
        assert!(untouched.is_open());
    }

    #[tokio::test]
    async fn test_alert_tick_triggers_once_and_dispatches() {
        let (services, quotes) = services().await;
        services
            .alerts
            .create_alert("admin", "BTCUSDT", dec!(60000), AlertCondition::Above, None)
            .await
            .unwrap();
        services
            .alerts
            .create_alert("admin", "BTCUSDT", dec!(40000), AlertCondition::Below, None)
            .await
            .unwrap();
        quotes.set("BTCUSDT", dec!(61000));

        let handles = services.alert_tick().await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }

        let pending = services.alerts.list_alerts("admin", Some(AlertStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trigger_condition, AlertCondition::Below);
        assert!(services.alert_tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_tick_quote_outage_is_transient() {
        let (services, _) = services().await;
        services
            .alerts
            .create_alert("admin", "SOLUSDT", dec!(200), AlertCondition::Above, None)
            .await
            .unwrap();
        // No SOL price: nothing fires, nothing fails
        assert!(services.alert_tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loop_runs_risk_tick_and_heartbeat() {
        let config = EngineConfig {
            risk_interval_secs: 3600,
            alert_interval_secs: 3600,
            reconcile_interval_secs: 3600,
            ..EngineConfig::default()
        };
        let (services, quotes) = services_with(config).await;
        let pos = services.ledger.open(btc_long()).await.unwrap();
        quotes.set("BTCUSDT", dec!(47500));

        let scheduler = Scheduler::new(services);
        assert!(scheduler.start().await.success);

        // Intervals fire immediately on start
        let mut closed = false;
        for _ in 0..50 {
            if !scheduler.services().ledger.get_position(pos.id).await.unwrap().is_open() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed);

        let closed = scheduler.services().ledger.get_position(pos.id).await.unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::StopLoss));

        let status = scheduler.status().await;
        let risk = status.jobs.iter().find(|j| j.name == "risk_tick").unwrap();
        assert!(risk.runs >= 1);

        scheduler.stop().await;
        scheduler.join().await;

        let heartbeat = scheduler.services().db.get_scheduler_heartbeat().await.unwrap().unwrap();
        assert!(!heartbeat.is_running);
        assert!(heartbeat.last_risk_tick_at.is_some());
    }

    #[tokio::test]
    async fn test_risk_tick_quote_outage_fails_tick() {
        let db = Database::in_memory().await.unwrap();
        let services = services_on(db, EngineConfig::default(), Arc::new(FailingQuotes));
        let pos = services.ledger.open(btc_long()).await.unwrap();

        let err = services.risk_tick().await.unwrap_err();
        assert!(matches!(err, EngineError::QuoteUnavailable(_)));
        assert!(err.is_transient());
        assert!(services.ledger.get_position(pos.id).await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_loop_survives_failed_risk_tick() {
        let db = Database::in_memory().await.unwrap();
        let services = services_on(db, quiet_config(), Arc::new(FailingQuotes));
        services.ledger.open(btc_long()).await.unwrap();

        let scheduler = Scheduler::new(services);
        assert!(scheduler.start().await.success);

        let mut failures = 0;
        for _ in 0..50 {
            let status = scheduler.status().await;
            failures = status
                .jobs
                .iter()
                .find(|j| j.name == "risk_tick")
                .map(|j| j.failures)
                .unwrap_or(0);
            if failures >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(failures >= 1);

        let status = scheduler.status().await;
        assert!(status.running);
        let risk = status.jobs.iter().find(|j| j.name == "risk_tick").unwrap();
        assert_eq!(risk.runs, risk.failures);

        scheduler.stop().await;
        scheduler.join().await;
        let heartbeat = scheduler.services().db.get_scheduler_heartbeat().await.unwrap().unwrap();
        assert!(heartbeat.last_risk_tick_at.is_some());
    }

    #[tokio::test]
    async fn test_risk_tick_settles_rest_after_close_race() {
        let db = Database::in_memory().await.unwrap();
        let config = EngineConfig::default();
        let ledger = PositionLedger::new(db.clone(), &config);

        let btc = ledger.open(btc_long()).await.unwrap();
        let mut eth = btc_long();
        eth.symbol = "ETHUSDT".to_string();
        eth.entry_price = dec!(2500);
        eth.stop_loss = Some(dec!(2400));
        let eth = ledger.open(eth).await.unwrap();

        // Both breach their stop; BTC is closed by hand before the tick settles it
        let quotes = ClosingQuotes {
            ledger: ledger.clone(),
            position_id: btc.id,
            prices: HashMap::from([
                ("BTCUSDT".to_string(), dec!(47500)),
                ("ETHUSDT".to_string(), dec!(2350)),
            ]),
        };
        let services = services_on(db, config, Arc::new(quotes));

        let report = services.risk_tick().await.unwrap();
        assert_eq!(report.positions, 2);
        assert_eq!(report.already_closed, 1);
        assert_eq!(report.closed, 1);
        assert_eq!(report.failed, 0);

        let btc = services.ledger.get_position(btc.id).await.unwrap();
        assert_eq!(btc.close_reason, Some(CloseReason::Manual));
        assert_eq!(btc.close_price, Some(dec!(50000)));
        assert_eq!(btc.realized_pnl, Decimal::ZERO);

        let eth = services.ledger.get_position(eth.id).await.unwrap();
        assert_eq!(eth.status, PositionStatus::Closed);
        assert_eq!(eth.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(eth.realized_pnl, dec!(-600));

        // BTC margin came back once, at the manual close
        assert_eq!(services.ledger.ensure_wallet("admin").await.unwrap().current_balance, dec!(9400));
    }

    #[tokio::test]
    async fn test_restart_waits_without_blocking_status() {
        let db = Database::in_memory().await.unwrap();
        let quotes = Arc::new(GatedQuotes {
            entered: Notify::new(),
            gate: Semaphore::new(0),
        });
        let services = services_on(db, quiet_config(), quotes.clone());
        services.ledger.open(btc_long()).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(services));
        assert!(scheduler.start().await.success);

        // First risk tick is now stuck fetching prices
        quotes.entered.notified().await;
        assert!(scheduler.stop().await.success);

        let restart = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!restart.is_finished());

        let status = tokio::time::timeout(Duration::from_secs(1), scheduler.status())
            .await
            .expect("status blocked behind restart");
        assert!(!status.running);
        let stop = tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .expect("stop blocked behind restart");
        assert_eq!(stop.message, "not running");

        quotes.gate.add_permits(1);
        let restarted = restart.await.unwrap();
        assert_eq!(restarted, StartResult::ok("started"));
        assert!(scheduler.status().await.running);

        scheduler.stop().await;
        scheduler.join().await;
    }
}
