//! Boundary to the strategy decision layer and the notification layer.
//!
//! The decision layer only expresses intent. Every action it returns is
//! validated here and executed through the user's gateway, which prices
//! and sizes it itself.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::gateway::{OpenOrder, TradingGateway};
use crate::models::{CloseReason, Direction, Position, PriceAlert, WalletSummary};
use crate::trading::EngineConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(120);
const WEBHOOK_MAX_ELAPSED: Duration = Duration::from_secs(300);

/// What woke the decision layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionTrigger {
    Hourly,
    Alert { alert: PriceAlert },
}

impl DecisionTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionTrigger::Hourly => "hourly",
            DecisionTrigger::Alert { .. } => "alert",
        }
    }
}

/// Context handed to the decision layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub user_id: String,
    pub trigger: DecisionTrigger,
    pub symbols: Vec<String>,
    pub wallet: WalletSummary,
    pub positions: Vec<Position>,
}

fn full_close() -> Decimal {
    dec!(100)
}

/// Intended action returned by the decision layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StrategyAction {
    Open {
        symbol: String,
        direction: Direction,
        margin: Decimal,
        leverage: u32,
        #[serde(default)]
        stop_loss: Option<Decimal>,
        #[serde(default)]
        take_profit: Option<Decimal>,
    },
    Close {
        symbol: String,
        #[serde(default = "full_close")]
        percent: Decimal,
    },
    Adjust {
        symbol: String,
        #[serde(default)]
        stop_loss: Option<Decimal>,
        #[serde(default)]
        take_profit: Option<Decimal>,
    },
    Hold,
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    actions: Vec<StrategyAction>,
}

#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Vec<StrategyAction>>;
}

/// Never trades. Used when no decision endpoint is configured.
pub struct HoldDecisionMaker;

#[async_trait]
impl DecisionMaker for HoldDecisionMaker {
    async fn decide(&self, request: &DecisionRequest) -> Result<Vec<StrategyAction>> {
        debug!(user = %request.user_id, trigger = request.trigger.label(), "No decision endpoint, holding");
        Ok(vec![StrategyAction::Hold])
    }
}

/// POSTs the request as JSON and reads `{"actions": [...]}` back.
pub struct WebhookDecisionMaker {
    client: Client,
    url: String,
    max_elapsed: Duration,
}

impl WebhookDecisionMaker {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            max_elapsed: WEBHOOK_MAX_ELAPSED,
        })
    }

    /// Cap on total retry time.
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }
}

#[async_trait]
impl DecisionMaker for WebhookDecisionMaker {
    async fn decide(&self, request: &DecisionRequest) -> Result<Vec<StrategyAction>> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        let response: DecisionResponse = backoff::future::retry(policy, || async move {
            let response = match self.client.post(&self.url).json(request).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Decision webhook unreachable, retrying");
                    return Err(backoff::Error::transient(
                        anyhow::Error::new(e).context("Decision webhook unreachable"),
                    ));
                }
            };

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, "Decision webhook failed, retrying");
                return Err(backoff::Error::transient(anyhow::anyhow!(
                    "Decision webhook failed: {} - {}",
                    status,
                    body
                )));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(anyhow::anyhow!(
                    "Decision webhook rejected request: {} - {}",
                    status,
                    body
                )));
            }

            response
                .json::<DecisionResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(anyhow::Error::new(e).context("Failed to parse decision response")))
        })
        .await?;

        Ok(response.actions)
    }
}

// ==================== Action Execution ====================

/// Check an action against the engine's own limits before it reaches a gateway.
pub fn validate_action(config: &EngineConfig, action: &StrategyAction) -> EngineResult<()> {
    let check_symbol = |symbol: &str| {
        if config.is_tradable(symbol) {
            Ok(())
        } else {
            Err(EngineError::InvalidRequest(format!("{} is not in the symbol universe", symbol)))
        }
    };

    match action {
        StrategyAction::Open { symbol, margin, leverage, .. } => {
            check_symbol(symbol)?;
            if *margin <= Decimal::ZERO {
                return Err(EngineError::InvalidRequest(format!("margin must be positive, got {}", margin)));
            }
            if *leverage < 1 || *leverage > config.max_leverage {
                return Err(EngineError::InvalidRequest(format!(
                    "leverage must be 1-{}, got {}",
                    config.max_leverage, leverage
                )));
            }
            Ok(())
        }
        StrategyAction::Close { symbol, percent } => {
            check_symbol(symbol)?;
            if *percent <= Decimal::ZERO || *percent > dec!(100) {
                return Err(EngineError::InvalidRequest(format!("percent must be in (0, 100], got {}", percent)));
            }
            Ok(())
        }
        StrategyAction::Adjust { symbol, stop_loss, take_profit } => {
            check_symbol(symbol)?;
            if stop_loss.is_none() && take_profit.is_none() {
                return Err(EngineError::InvalidRequest("nothing to adjust".into()));
            }
            Ok(())
        }
        StrategyAction::Hold => Ok(()),
    }
}

/// Result of executing one action.
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: StrategyAction,
    pub result: EngineResult<()>,
}

/// Validate and execute actions in order. One failure does not stop the rest.
pub async fn apply_actions(
    gateway: &dyn TradingGateway,
    config: &EngineConfig,
    actions: Vec<StrategyAction>,
) -> Vec<ActionOutcome> {
    let mut outcomes = Vec::with_capacity(actions.len());

    for action in actions {
        let result = match validate_action(config, &action) {
            Ok(()) => execute(gateway, &action).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => info!(user = %gateway.user_id(), action = ?action, "Strategy action applied"),
            Err(e) => warn!(
                user = %gateway.user_id(),
                action = ?action,
                error = %e,
                category = e.category(),
                "Strategy action rejected"
            ),
        }

        outcomes.push(ActionOutcome { action, result });
    }

    outcomes
}

async fn execute(gateway: &dyn TradingGateway, action: &StrategyAction) -> EngineResult<()> {
    match action {
        StrategyAction::Open {
            symbol,
            direction,
            margin,
            leverage,
            stop_loss,
            take_profit,
        } => {
            gateway
                .open(OpenOrder {
                    symbol: symbol.to_uppercase(),
                    direction: *direction,
                    margin: *margin,
                    leverage: *leverage,
                    stop_loss: *stop_loss,
                    take_profit: *take_profit,
                })
                .await?;
        }
        StrategyAction::Close { symbol, percent } => {
            gateway.close(symbol, *percent, CloseReason::Strategy).await?;
        }
        StrategyAction::Adjust {
            symbol,
            stop_loss,
            take_profit,
        } => {
            gateway.adjust_stop_loss(symbol, *stop_loss, *take_profit).await?;
        }
        StrategyAction::Hold => {}
    }
    Ok(())
}

// ==================== Notifications ====================

/// Completion record of one decision round.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRoundSummary {
    pub user_id: String,
    pub trigger: &'static str,
    pub actions: usize,
    pub applied: usize,
    pub rejected: usize,
}

impl DecisionRoundSummary {
    pub fn from_outcomes(user_id: &str, trigger: &DecisionTrigger, outcomes: &[ActionOutcome]) -> Self {
        let applied = outcomes.iter().filter(|o| o.result.is_ok()).count();
        Self {
            user_id: user_id.to_string(),
            trigger: trigger.label(),
            actions: outcomes.len(),
            applied,
            rejected: outcomes.len() - applied,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn alert_triggered(&self, alert: &PriceAlert);

    async fn decision_round_completed(&self, summary: &DecisionRoundSummary);
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn alert_triggered(&self, alert: &PriceAlert) {
        info!(
            alert_id = alert.id,
            user = %alert.user_id,
            symbol = %alert.symbol,
            condition = %alert.trigger_condition,
            trigger = %alert.trigger_price,
            price = ?alert.triggered_price,
            "Price alert fired"
        );
    }

    async fn decision_round_completed(&self, summary: &DecisionRoundSummary) {
        info!(
            user = %summary.user_id,
            trigger = summary.trigger,
            actions = summary.actions,
            applied = summary.applied,
            rejected = summary.rejected,
            "Decision round completed"
        );
    }
}

/// One full round: summarize, ask, apply, notify.
pub async fn run_decision_round(
    gateway: &dyn TradingGateway,
    maker: &dyn DecisionMaker,
    notifier: &dyn Notifier,
    config: &EngineConfig,
    trigger: DecisionTrigger,
) -> Result<DecisionRoundSummary> {
    let account = gateway.summarize().await?;
    let request = DecisionRequest {
        user_id: gateway.user_id().to_string(),
        trigger,
        symbols: config.symbols.clone(),
        wallet: account.wallet,
        positions: account.positions,
    };

    let actions = maker.decide(&request).await?;
    let outcomes = apply_actions(gateway, config, actions).await;
    let summary = DecisionRoundSummary::from_outcomes(&request.user_id, &request.trigger, &outcomes);
    notifier.decision_round_completed(&summary).await;

    Ok(summary)
}
