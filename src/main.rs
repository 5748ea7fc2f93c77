use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use scalpbot::api::{BinanceClient, Exchange, PaperExchange};
use scalpbot::config::Settings;
use scalpbot::db::PostgresEventLog;
use scalpbot::engine::{EngineSettings, Orchestrator};
use scalpbot::events::{EventDispatcher, EventPublisher, EventSink};
use scalpbot::execution::{Executor, MarketFeed, Portfolio, PositionSupervisor};
use scalpbot::notify::{Notifier, TelegramNotifier};
use scalpbot::persistence::{restore_state, RedisStateStore, StateStore};
use scalpbot::risk::RiskGovernor;
use scalpbot::strategy::{ScalpingStrategy, Strategy};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "scalpbot", version, about = "RSI scalping bot for Binance spot markets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop (paper fills unless --live)
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Place real orders on the exchange
        #[arg(long)]
        live: bool,
        /// Close every open position at market before exiting
        #[arg(long)]
        close_on_shutdown: bool,
    },
    /// Load, validate and print the effective settings
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Score the latest candles of one symbol and print the result
    Analyze {
        symbol: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    match Cli::parse().command {
        Command::Run {
            config,
            live,
            close_on_shutdown,
        } => run(config, live, close_on_shutdown).await,
        Command::CheckConfig { config } => check_config(config),
        Command::Analyze { symbol, config } => analyze(config, &symbol).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scalpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn market_client(settings: &Settings, live: bool) -> Result<BinanceClient> {
    let timeout = Duration::from_secs(settings.network.request_timeout_secs);
    let base_url = Some(settings.binance.base_url.clone());
    let rpm = settings.network.requests_per_minute;

    match (&settings.binance.api_key, &settings.binance.secret_key) {
        (Some(key), Some(secret)) if live => BinanceClient::new(key, secret, base_url, timeout, rpm),
        _ => BinanceClient::public(base_url, timeout, rpm),
    }
}

async fn connect_to_redis(redis_url: Option<&str>) -> Option<Arc<dyn StateStore>> {
    let Some(url) = redis_url else {
        tracing::warn!("REDIS_URL not set, state will not survive a restart");
        return None;
    };

    match RedisStateStore::new(url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!("Failed to connect to Redis ({}), continuing without state persistence", e);
            None
        }
    }
}

async fn connect_to_postgres(database_url: Option<&str>) -> Option<PostgresEventLog> {
    let url = database_url?;

    match PostgresEventLog::new(url).await {
        Ok(log) => {
            tracing::info!("Postgres event log enabled");
            Some(log)
        }
        Err(e) => {
            tracing::warn!("Failed to connect to Postgres ({}), continuing without event log", e);
            None
        }
    }
}

fn telegram_notifier(settings: &Settings) -> Option<Arc<dyn Notifier>> {
    let (Some(token), Some(chat_id)) = (&settings.telegram.bot_token, &settings.telegram.chat_id) else {
        tracing::info!("Telegram not configured, notifications go to the log only");
        return None;
    };

    match TelegramNotifier::new(token, chat_id, Some(settings.telegram.base_url.clone())) {
        Ok(notifier) => Some(Arc::new(notifier)),
        Err(e) => {
            tracing::warn!("Telegram disabled: {:#}", e);
            None
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: Option<PathBuf>, live: bool, close_on_shutdown: bool) -> Result<()> {
    let settings = Settings::load(config.as_deref()).context("invalid configuration")?;
    if live {
        settings.require_credentials().context("invalid configuration")?;
    }

    tracing::info!(
        "🚀 ScalpBot starting in {} mode",
        if live { "LIVE" } else { "PAPER" }
    );

    let market: Arc<dyn Exchange> = Arc::new(market_client(&settings, live)?);
    let exchange: Arc<dyn Exchange> = if live {
        market
    } else {
        Arc::new(PaperExchange::new(
            market,
            settings.quote_asset.clone(),
            settings.paper.starting_balance,
        ))
    };

    // Restore risk counters and open positions
    let store = connect_to_redis(settings.redis_url.as_deref()).await;
    let restored = match &store {
        Some(store) => restore_state(store.as_ref()).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to load saved state: {}", e);
            None
        }),
        None => None,
    };

    let (risk, positions) = match restored {
        Some(snapshot) => {
            let positions = if live {
                snapshot.positions
            } else {
                tracing::info!("Paper mode: saved positions are not resumed");
                Vec::new()
            };
            (RiskGovernor::with_state(settings.risk.clone(), snapshot.risk), positions)
        }
        None => (RiskGovernor::new(settings.risk.clone()), Vec::new()),
    };
    let risk = Arc::new(risk);
    let portfolio = Arc::new(Portfolio::with_positions(
        settings.position.max_open_positions,
        positions,
    ));

    // Events: log + Postgres + Telegram
    let (events, events_rx) = EventPublisher::channel(EVENT_CHANNEL_CAPACITY);
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(log) = connect_to_postgres(settings.database_url.as_deref()).await {
        match log.get_total_pnl().await {
            Ok(total) => tracing::info!("  Lifetime realized P&L: ${:.2}", total),
            Err(e) => tracing::warn!("Failed to read lifetime P&L: {}", e),
        }
        sinks.push(Arc::new(log));
    }
    let dispatcher = EventDispatcher::new(events_rx, sinks, telegram_notifier(&settings)).spawn();

    let retry = settings.network.retry_policy();
    let feed = MarketFeed::new(
        exchange.clone(),
        retry.clone(),
        settings.interval.clone(),
        settings.candle_limit,
    );
    let executor = Executor::new(portfolio.clone(), risk.clone(), settings.position.sizing());
    let supervisor = Arc::new(PositionSupervisor::new(
        exchange.clone(),
        feed,
        portfolio,
        risk,
        executor,
        settings.exit_rules(),
        retry,
        events.clone(),
        settings.quote_asset.clone(),
    ));
    let strategy: Arc<dyn Strategy> = Arc::new(ScalpingStrategy::new(settings.strategy.clone()));

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange: {}", exchange.name());
    tracing::info!("  Symbols: {}", settings.symbols.join(", "));
    tracing::info!("  Interval: {} ({} candles)", settings.interval, settings.candle_limit);
    tracing::info!(
        "  Entry: {}/6 conditions, RSI < {}",
        settings.strategy.min_conditions,
        settings.strategy.rsi_threshold
    );
    tracing::info!(
        "  Exits: TP {}% | SL {}% | trail {}% after +{}% | max hold {}m",
        settings.position.take_profit_percent,
        settings.position.stop_loss_percent,
        settings.position.trailing_distance_percent,
        settings.position.trailing_activation_percent,
        settings.position.max_hold_minutes
    );
    tracing::info!(
        "  Risk: {} trades/day, {}/hour, ${:.0} daily loss, pause after {} losses",
        settings.risk.max_daily_trades,
        settings.risk.max_trades_per_hour,
        settings.risk.max_daily_loss_usd,
        settings.risk.max_loss_streak
    );

    let orchestrator = Arc::new(Orchestrator::new(
        supervisor,
        strategy,
        events,
        store,
        EngineSettings::from_settings(&settings, close_on_shutdown),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine = tokio::spawn(orchestrator.run(shutdown_rx));

    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Wait for Ctrl+C or engine failure
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            let _ = shutdown_tx.send(true);
            match engine.await {
                Ok(summary) => tracing::info!("Engine summary: {:?}", summary),
                Err(e) => tracing::error!("Engine task failed: {}", e),
            }
        }
        result = &mut engine => {
            tracing::error!("Engine exited: {:?}", result);
        }
    }

    // Every publisher is gone once the engine stops; let the dispatcher flush
    if tokio::time::timeout(Duration::from_secs(10), dispatcher).await.is_err() {
        tracing::warn!("Event dispatcher did not drain in time");
    }

    tracing::info!("👋 ScalpBot stopped");
    Ok(())
}

fn check_config(config: Option<PathBuf>) -> Result<()> {
    let settings = Settings::load(config.as_deref()).context("invalid configuration")?;

    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!();
    println!("binance credentials: {}", present(settings.binance.api_key.is_some() && settings.binance.secret_key.is_some()));
    println!("telegram:            {}", present(settings.telegram.bot_token.is_some() && settings.telegram.chat_id.is_some()));
    println!("redis:               {}", present(settings.redis_url.is_some()));
    println!("postgres:            {}", present(settings.database_url.is_some()));
    println!("\n✅ Configuration is valid");
    Ok(())
}

fn present(yes: bool) -> &'static str {
    if yes {
        "set"
    } else {
        "not set"
    }
}

async fn analyze(config: Option<PathBuf>, symbol: &str) -> Result<()> {
    let settings = Settings::load(config.as_deref()).context("invalid configuration")?;
    let market: Arc<dyn Exchange> = Arc::new(market_client(&settings, false)?);
    let feed = MarketFeed::new(
        market,
        settings.network.retry_policy(),
        settings.interval.clone(),
        settings.candle_limit,
    );
    let strategy = ScalpingStrategy::new(settings.strategy.clone());

    let candles = feed
        .candles(symbol)
        .await
        .with_context(|| format!("failed to fetch candles for {}", symbol))?;
    let evaluation = strategy.evaluate(&candles)?;

    println!("📊 {} @ ${:.4} ({} candles)", symbol, evaluation.close, candles.len());
    println!("{}", serde_json::to_string_pretty(&evaluation.snapshot)?);
    println!(
        "\nConditions: {} ({}/6, need {})",
        evaluation.conditions.summary(),
        evaluation.conditions.satisfied_count(),
        settings.strategy.min_conditions
    );
    println!(
        "Entry signal: {}",
        if evaluation.entry_signal { "YES 🟢" } else { "no" }
    );
    Ok(())
}
