//! Leveraged Futures Simulator
//!
//! Simulated USDT-margined futures wallets with automatic liquidation,
//! stop-loss/take-profit enforcement, price alerts and an hourly decision
//! round. Users with live credentials are routed to the exchange instead.

mod api;
mod db;
mod decision;
mod error;
mod gateway;
mod models;
mod scheduler;
mod trading;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{PriceFeed, QuoteSource};
use crate::db::Database;
use crate::decision::{DecisionMaker, HoldDecisionMaker, LogNotifier, WebhookDecisionMaker};
use crate::gateway::OpenOrder;
use crate::models::{AlertCondition, AlertStatus, CloseReason, Direction, Position, PositionStatus};
use crate::scheduler::{EngineServices, Scheduler};
use crate::trading::EngineConfig;

/// Leveraged futures simulator CLI.
#[derive(Parser)]
#[command(name = "futsim")]
#[command(about = "Simulated leveraged futures trading with automatic risk control", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./futsim.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Account to act on
    #[arg(short, long, env = "FUTSIM_USER", default_value = "admin")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler (risk, alert, strategy and reconcile jobs)
    Run,

    /// Show the wallet summary
    Wallet,

    /// Open a position at the current mark price
    Open {
        /// Symbol, e.g. BTCUSDT
        symbol: String,

        /// long or short
        direction: Direction,

        /// Margin in USDT
        #[arg(short, long)]
        margin: Decimal,

        /// Leverage multiplier
        #[arg(short = 'x', long, default_value = "10")]
        leverage: u32,

        #[arg(long)]
        stop_loss: Option<Decimal>,

        #[arg(long)]
        take_profit: Option<Decimal>,
    },

    /// Close all or part of a position at the current mark price
    Close {
        symbol: String,

        /// Percent of the remaining quantity to close
        #[arg(short, long, default_value = "100")]
        percent: Decimal,
    },

    /// Move stop-loss and/or take-profit
    Adjust {
        symbol: String,

        #[arg(long)]
        stop_loss: Option<Decimal>,

        #[arg(long)]
        take_profit: Option<Decimal>,
    },

    /// List positions (open by default)
    Positions {
        /// OPEN, CLOSED or LIQUIDATED
        #[arg(short, long)]
        status: Option<PositionStatus>,

        /// Include every status
        #[arg(long)]
        all: bool,
    },

    /// Show recent orders
    Orders {
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Only orders of this position
        #[arg(short, long)]
        position: Option<i64>,
    },

    /// Manage price alerts
    Alert {
        #[command(subcommand)]
        command: AlertCommands,
    },

    /// Manage live exchange credentials
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Show scheduler heartbeat and account status
    Status,

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum AlertCommands {
    /// Create a single-shot alert
    Add {
        symbol: String,

        /// Trigger price
        price: Decimal,

        /// ABOVE or BELOW
        condition: AlertCondition,

        /// Free-form context passed to the decision round
        #[arg(long)]
        note: Option<String>,
    },

    /// List alerts
    List {
        /// PENDING, TRIGGERED or CANCELLED
        #[arg(short, long)]
        status: Option<AlertStatus>,
    },

    /// Cancel a pending alert
    Cancel { id: i64 },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Save API credentials
    Configure {
        #[arg(long, env = "FUTSIM_API_KEY")]
        api_key: String,

        #[arg(long, env = "FUTSIM_API_SECRET")]
        api_secret: String,

        /// Route this user's trades to the exchange
        #[arg(long)]
        live: bool,
    },

    /// Block live order placement for this user
    Disable,

    /// Show stored credentials and the live account summary
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EngineConfig::from_env()?;
    config.validate()?;

    let db = Database::new(&cli.database).await?;
    let services = build_services(config, db)?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Run => {
            let scheduler = Scheduler::new(services.clone());
            let started = scheduler.start().await;
            if !started.success {
                println!("Scheduler not started: {}", started.message);
                return Ok(());
            }

            let config = &services.config;
            println!("\n=== Futures Simulator ===");
            println!("Symbols:          {}", config.symbols.join(", "));
            println!("Risk interval:    {}s", config.risk_interval_secs);
            println!("Alert interval:   {}s", config.alert_interval_secs);
            println!("Strategy minute:  :{:02}", config.strategy_minute);
            println!("Strategy users:   {}", config.strategy_users.join(", "));
            println!(
                "Decision source:  {}",
                config.decision_webhook_url.as_deref().unwrap_or("hold (no webhook)")
            );
            println!("\nPress Ctrl+C to stop.\n");

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");

            scheduler.stop().await;
            scheduler.join().await;

            for user in &config.strategy_users {
                if let Ok(summary) = services.ledger.wallet_summary(user).await {
                    println!("\n{}", summary);
                }
            }
        }

        Commands::Wallet => {
            let gateway = services.gateways.for_user(user).await?;
            let summary = gateway.summarize().await?;
            println!("\nMode: {}", summary.variant);
            println!("{}", summary.wallet);
        }

        Commands::Open {
            symbol,
            direction,
            margin,
            leverage,
            stop_loss,
            take_profit,
        } => {
            let symbol = symbol.to_uppercase();
            if !services.config.is_tradable(&symbol) {
                anyhow::bail!("{} is not in the tradable universe", symbol);
            }

            let gateway = services.gateways.for_user(user).await?;
            let pos = gateway
                .open(OpenOrder {
                    symbol,
                    direction,
                    margin,
                    leverage,
                    stop_loss,
                    take_profit,
                })
                .await?;

            println!(
                "Opened {} {} {}x: qty {} @ {} (margin ${})",
                pos.direction, pos.symbol, pos.leverage, pos.quantity, pos.entry_price, pos.margin
            );
        }

        Commands::Close { symbol, percent } => {
            let gateway = services.gateways.for_user(user).await?;
            let report = gateway.close(&symbol, percent, CloseReason::Manual).await?;

            println!(
                "{} {}: qty {} @ {} (P&L: ${:.2})",
                if report.fully_closed { "Closed" } else { "Reduced" },
                report.symbol,
                report.closed_quantity,
                report.price,
                report.realized_pnl
            );
        }

        Commands::Adjust {
            symbol,
            stop_loss,
            take_profit,
        } => {
            if stop_loss.is_none() && take_profit.is_none() {
                anyhow::bail!("Nothing to adjust: pass --stop-loss and/or --take-profit");
            }

            let gateway = services.gateways.for_user(user).await?;
            gateway.adjust_stop_loss(&symbol, stop_loss, take_profit).await?;
            println!("Updated {} protection", symbol.to_uppercase());
        }

        Commands::Positions { status, all } => {
            let positions = if all || status.is_some() {
                services.ledger.list_positions(user, status).await?
            } else {
                services.gateways.for_user(user).await?.summarize().await?.positions
            };

            if positions.is_empty() {
                println!("No positions.");
                return Ok(());
            }
            print_positions(&positions);
        }

        Commands::Orders { limit, position } => {
            let orders = match position {
                Some(id) => services.ledger.position_orders(id).await?,
                None => services.ledger.list_orders(user, limit).await?,
            };
            if orders.is_empty() {
                println!("No orders.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<12} {:<14} {:>12} {:>12} {:>10} {:>12} {:<12}",
                "ID", "SYMBOL", "ACTION", "PRICE", "QTY", "FEE", "P&L", "REASON"
            );
            println!("{}", "-".repeat(98));
            for order in orders {
                println!(
                    "{:<6} {:<12} {:<14} {:>12} {:>12} {:>10.4} {:>12.2} {:<12}",
                    order.id,
                    order.symbol,
                    order.action,
                    order.price,
                    order.quantity,
                    order.fee,
                    order.realized_pnl,
                    order.reason
                );
            }
        }

        Commands::Alert { command } => match command {
            AlertCommands::Add {
                symbol,
                price,
                condition,
                note,
            } => {
                let symbol = symbol.to_uppercase();
                if !services.config.is_tradable(&symbol) {
                    anyhow::bail!("{} is not in the tradable universe", symbol);
                }
                let alert = services
                    .alerts
                    .create_alert(user, &symbol, price, condition, note.as_deref())
                    .await?;
                println!(
                    "Alert #{}: {} {} {}",
                    alert.id, alert.symbol, alert.trigger_condition, alert.trigger_price
                );
            }

            AlertCommands::List { status } => {
                let alerts = services.alerts.list_alerts(user, status).await?;
                if alerts.is_empty() {
                    println!("No alerts.");
                    return Ok(());
                }

                println!(
                    "\n{:<6} {:<12} {:<6} {:>12} {:<10} {:>12} {:<20}",
                    "ID", "SYMBOL", "WHEN", "PRICE", "STATUS", "HIT AT", "CREATED"
                );
                println!("{}", "-".repeat(84));
                for alert in alerts {
                    println!(
                        "{:<6} {:<12} {:<6} {:>12} {:<10} {:>12} {:<20}",
                        alert.id,
                        alert.symbol,
                        alert.trigger_condition,
                        alert.trigger_price,
                        alert.status,
                        alert
                            .triggered_price
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        alert.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }

            AlertCommands::Cancel { id } => {
                services.alerts.cancel_alert(id).await?;
                println!("Cancelled alert #{}", id);
            }
        },

        Commands::Account { command } => match command {
            AccountCommands::Configure {
                api_key,
                api_secret,
                live,
            } => {
                services
                    .db
                    .save_exchange_account(user, &api_key, &api_secret, true, live)
                    .await?;
                services.gateways.invalidate(user).await;
                println!(
                    "Saved credentials for {} (mode: {})",
                    user,
                    if live { "live" } else { "virtual" }
                );
            }

            AccountCommands::Disable => {
                if services.db.set_trading_enabled(user, false).await? {
                    services.gateways.invalidate(user).await;
                    println!("Live trading disabled for {}", user);
                } else {
                    println!("No exchange account for {}", user);
                }
            }

            AccountCommands::Show => {
                let Some(account) = services.db.get_exchange_account(user).await? else {
                    println!("No exchange account for {}. Use 'futsim account configure' to add one.", user);
                    return Ok(());
                };

                println!("\n=== Exchange Account: {} ===", user);
                println!("API Key:          {}", mask(&account.api_key));
                println!("Live Mode:        {}", if account.live_mode { "Yes" } else { "No" });
                println!("Trading Enabled:  {}", if account.trading_enabled { "Yes" } else { "No" });
                println!("Updated:          {}", account.updated_at);

                if let Some(totals) = services.db.get_live_totals(user).await? {
                    println!("\n--- Reconciled ---");
                    println!("Realized P&L:     ${:.2}", totals.total_pnl);
                    println!("Trades:           {}", totals.total_trades);
                    println!("Wins:             {}", totals.win_trades);
                }

                if account.live_mode {
                    match services.gateways.for_user(user).await?.summarize().await {
                        Ok(summary) => println!("\n{}", summary.wallet),
                        Err(e) => println!("\nLive account unavailable: {}", e),
                    }
                }
            }
        },

        Commands::Status => {
            match services.db.get_scheduler_heartbeat().await? {
                Some(hb) => {
                    let fmt = |t: Option<chrono::DateTime<chrono::Utc>>| {
                        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "Never".to_string())
                    };
                    println!("\n=== Scheduler ===");
                    println!("Running:          {}", if hb.is_running { "Yes" } else { "No" });
                    println!("Started:          {}", fmt(hb.started_at));
                    println!("Last Risk Tick:   {}", fmt(hb.last_risk_tick_at));
                    println!("Last Alert Tick:  {}", fmt(hb.last_alert_tick_at));
                    println!("Last Strategy:    {}", fmt(hb.last_strategy_tick_at));
                    println!("Last Reconcile:   {}", fmt(hb.last_reconcile_at));
                }
                None => println!("Scheduler has never run. Use 'futsim run' to start it."),
            }

            let summary = services.ledger.wallet_summary(user).await?;
            let positions = services.ledger.list_positions(user, Some(PositionStatus::Open)).await?;
            let alerts = services.alerts.list_alerts(user, Some(AlertStatus::Pending)).await?;

            println!("\n=== Account: {} ===", user);
            println!("Equity:           ${:.2}", summary.equity);
            println!("Open Positions:   {}", positions.len());
            println!("Pending Alerts:   {}", alerts.len());
            println!("Total Trades:     {}", summary.total_trades);
            println!("Win Rate:         {:.1}%", summary.win_rate * Decimal::ONE_HUNDRED);

            if !positions.is_empty() {
                println!("\n=== Open Positions ===");
                print_positions(&positions);
            }
        }

        Commands::Config => {
            let config = &services.config;

            println!("\n=== Engine Configuration ===\n");
            println!("Wallet:");
            println!("  Initial Balance:      ${}", config.initial_balance);
            println!("  Fee Rate:             {}", config.fee_rate);
            println!("  Max Leverage:         {}x", config.max_leverage);

            println!("\nSchedule:");
            println!("  Risk Interval:        {}s", config.risk_interval_secs);
            println!("  Alert Interval:       {}s", config.alert_interval_secs);
            println!("  Strategy Minute:      :{:02}", config.strategy_minute);
            println!("  Reconcile Interval:   {}s", config.reconcile_interval_secs);

            println!("\nUniverse:");
            println!("  Symbols:              {}", config.symbols.join(", "));
            println!("  Strategy Users:       {}", config.strategy_users.join(", "));

            println!("\nEndpoints:");
            println!("  Quotes:               {}", config.quote_base_url);
            println!("  Exchange:             {}", config.exchange_base_url);
            println!(
                "  Decision Webhook:     {}",
                config.decision_webhook_url.as_deref().unwrap_or("(none)")
            );
        }
    }

    Ok(())
}

fn build_services(config: EngineConfig, db: Database) -> Result<EngineServices> {
    let quotes: Arc<dyn QuoteSource> = Arc::new(PriceFeed::new(&config.quote_base_url)?);
    let decision_maker: Arc<dyn DecisionMaker> = match &config.decision_webhook_url {
        Some(url) => Arc::new(WebhookDecisionMaker::new(url)?),
        None => Arc::new(HoldDecisionMaker),
    };

    Ok(EngineServices::new(
        config,
        db,
        quotes,
        decision_maker,
        Arc::new(LogNotifier),
    ))
}

fn print_positions(positions: &[Position]) {
    println!(
        "\n{:<6} {:<10} {:<6} {:>4} {:>12} {:>12} {:>12} {:>10} {:>12} {:>8} {:<10}",
        "ID", "SYMBOL", "SIDE", "LEV", "QTY", "ENTRY", "MARK", "MARGIN", "P&L", "ROE", "STATUS"
    );
    println!("{}", "-".repeat(113));

    for pos in positions {
        let pnl = if pos.is_open() { pos.unrealized_pnl } else { pos.realized_pnl };
        let pnl_sign = if pnl >= Decimal::ZERO { "+" } else { "" };
        println!(
            "{:<6} {:<10} {:<6} {:>3}x {:>12} {:>12} {:>12} {:>10.2} {:>12} {:>7.1}% {:<10}",
            pos.id,
            pos.symbol,
            pos.direction,
            pos.leverage,
            pos.remaining_quantity(),
            pos.entry_price,
            pos.current_price,
            pos.margin_in_use(),
            format!("{}{:.2}", pnl_sign, pnl),
            pos.return_on_margin(pos.current_price) * Decimal::ONE_HUNDRED,
            pos.status
        );
    }
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
