use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::retry::RetryPolicy;
use crate::execution::{ExitRules, MomentumExitRule, SizingRules, StagnationRule};
use crate::risk::RiskLimits;
use crate::strategy::{PairScreen, SignalConfig};

const ENV_PREFIX: &str = "SCALPBOT";
const DEFAULT_CONFIG_NAME: &str = "scalpbot";

/// Effective runtime settings: compiled defaults, then an optional TOML file,
/// then `SCALPBOT__SECTION__KEY` environment overrides. Secrets are read from
/// their conventional environment variables only and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub quote_asset: String,
    pub interval: String,
    pub candle_limit: usize,
    pub polling_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub strategy: SignalConfig,
    pub screen: PairScreen,
    pub position: PositionSettings,
    pub risk: RiskLimits,
    pub network: NetworkSettings,
    pub paper: PaperSettings,
    pub binance: BinanceSettings,
    pub telegram: TelegramSettings,
    #[serde(skip)]
    pub redis_url: Option<String>,
    #[serde(skip)]
    pub database_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: ["BTCUSDC", "ETHUSDC", "SOLUSDC", "ADAUSDC", "DOTUSDC"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quote_asset: "USDC".to_string(),
            interval: "1m".to_string(),
            candle_limit: 100,
            polling_interval_seconds: 40,
            shutdown_grace_seconds: 30,
            strategy: SignalConfig::default(),
            screen: PairScreen::default(),
            position: PositionSettings::default(),
            risk: RiskLimits::default(),
            network: NetworkSettings::default(),
            paper: PaperSettings::default(),
            binance: BinanceSettings::default(),
            telegram: TelegramSettings::default(),
            redis_url: None,
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSettings {
    pub position_size_percent: f64,
    pub min_position_usd: f64,
    pub max_position_usd: f64,
    pub size_reduction_factor: f64,
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub trailing_activation_percent: f64,
    pub trailing_distance_percent: f64,
    pub max_hold_minutes: i64,
    /// Close flat positions after this long. 0 disables.
    pub stagnation_minutes: i64,
    pub stagnation_low_percent: f64,
    pub stagnation_high_percent: f64,
    pub early_exit_enabled: bool,
    pub early_exit_after_minutes: i64,
    pub early_exit_rsi: f64,
    pub early_exit_max_pnl_percent: f64,
    pub max_open_positions: usize,
    pub fee_rate: f64,
}

impl Default for PositionSettings {
    fn default() -> Self {
        Self {
            position_size_percent: 5.0,
            min_position_usd: 50.0,
            max_position_usd: 500.0,
            size_reduction_factor: 0.8,
            take_profit_percent: 0.9,
            stop_loss_percent: 0.4,
            trailing_activation_percent: 0.5,
            trailing_distance_percent: 0.3,
            max_hold_minutes: 45,
            stagnation_minutes: 15,
            stagnation_low_percent: -0.1,
            stagnation_high_percent: 0.2,
            early_exit_enabled: true,
            early_exit_after_minutes: 5,
            early_exit_rsi: 25.0,
            early_exit_max_pnl_percent: -0.2,
            max_open_positions: 2,
            fee_rate: 0.001,
        }
    }
}

impl PositionSettings {
    pub fn exit_rules(&self) -> ExitRules {
        ExitRules {
            take_profit_pct: self.take_profit_percent / 100.0,
            stop_loss_pct: self.stop_loss_percent / 100.0,
            trailing_activation_pct: self.trailing_activation_percent / 100.0,
            trailing_distance_pct: self.trailing_distance_percent / 100.0,
            max_hold: chrono::Duration::minutes(self.max_hold_minutes),
            stagnation: (self.stagnation_minutes > 0).then(|| StagnationRule {
                after: chrono::Duration::minutes(self.stagnation_minutes),
                low_pct: self.stagnation_low_percent,
                high_pct: self.stagnation_high_percent,
            }),
            momentum_exit: self.early_exit_enabled.then(|| MomentumExitRule {
                after: chrono::Duration::minutes(self.early_exit_after_minutes),
                rsi_below: self.early_exit_rsi,
                max_pnl_pct: self.early_exit_max_pnl_percent,
                ..MomentumExitRule::default()
            }),
            fee_rate: self.fee_rate,
        }
    }

    pub fn sizing(&self) -> SizingRules {
        SizingRules {
            position_size_pct: self.position_size_percent / 100.0,
            min_position_usd: self.min_position_usd,
            max_position_usd: self.max_position_usd,
            size_reduction_factor: self.size_reduction_factor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub requests_per_minute: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            requests_per_minute: 600,
        }
    }
}

impl NetworkSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            call_timeout: Duration::from_secs(self.request_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    pub starting_balance: f64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            starting_balance: 1_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinanceSettings {
    pub base_url: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(skip)]
    pub secret_key: Option<String>,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            api_key: None,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub base_url: String,
    #[serde(skip)]
    pub bot_token: Option<String>,
    #[serde(skip)]
    pub chat_id: Option<String>,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.telegram.org".to_string(),
            bot_token: None,
            chat_id: None,
        }
    }
}

impl Settings {
    /// Exit rules with the momentum check reading the strategy's indicator periods
    pub fn exit_rules(&self) -> ExitRules {
        let mut rules = self.position.exit_rules();
        if let Some(rule) = rules.momentum_exit.as_mut() {
            rule.rsi_period = self.strategy.rsi_period;
            rule.macd_fast = self.strategy.macd_fast;
            rule.macd_slow = self.strategy.macd_slow;
            rule.macd_signal = self.strategy.macd_signal;
        }
        rules
    }

    /// Load settings from `path` (required when given) or `./scalpbot.toml`
    /// (optional), then environment overrides and secrets.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let raw = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = raw.try_deserialize()?;
        settings.apply_secrets(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Fill secret fields from a key lookup (the process environment in production)
    pub fn apply_secrets<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        self.binance.api_key = non_empty("BINANCE_API_KEY");
        self.binance.secret_key = non_empty("BINANCE_SECRET_KEY");
        self.telegram.bot_token = non_empty("TELEGRAM_BOT_TOKEN");
        self.telegram.chat_id = non_empty("TELEGRAM_CHAT_ID");
        self.redis_url = non_empty("REDIS_URL");
        self.database_url = non_empty("DATABASE_URL");
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.symbols.is_empty() {
            return invalid("at least one symbol must be tracked".into());
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return invalid("symbol names must not be empty".into());
        }
        if self.polling_interval_seconds == 0 {
            return invalid("polling_interval_seconds must be positive".into());
        }

        let s = &self.strategy;
        if s.rsi_period == 0
            || s.ema_fast == 0
            || s.ema_slow == 0
            || s.macd_fast == 0
            || s.macd_slow == 0
            || s.macd_signal == 0
            || s.bollinger_period == 0
            || s.volume_window == 0
            || s.breakout_lookback == 0
        {
            return invalid("indicator periods must be positive".into());
        }
        if s.ema_fast >= s.ema_slow || s.macd_fast >= s.macd_slow {
            return invalid("fast periods must be shorter than slow periods".into());
        }
        if !(s.rsi_threshold > 0.0 && s.rsi_threshold < 100.0) {
            return invalid(format!("rsi_threshold {} outside (0, 100)", s.rsi_threshold));
        }
        if s.bollinger_std_dev <= 0.0 || s.bollinger_touch_tolerance < 0.0 || s.breakout_tolerance < 0.0 {
            return invalid("bollinger and breakout tolerances must be non-negative".into());
        }
        if s.min_conditions == 0 || s.min_conditions > 6 {
            return invalid(format!("min_conditions {} outside 1..=6", s.min_conditions));
        }
        if s.min_volume_usd < 0.0 {
            return invalid("min_volume_usd must be non-negative".into());
        }
        if self.candle_limit < s.required_candles() {
            return invalid(format!(
                "candle_limit {} is shorter than the {} candles the indicators need",
                self.candle_limit,
                s.required_candles()
            ));
        }

        let p = &self.position;
        for (name, value) in [
            ("position_size_percent", p.position_size_percent),
            ("take_profit_percent", p.take_profit_percent),
            ("stop_loss_percent", p.stop_loss_percent),
            ("trailing_activation_percent", p.trailing_activation_percent),
            ("trailing_distance_percent", p.trailing_distance_percent),
        ] {
            if !(value > 0.0 && value < 100.0) {
                return invalid(format!("{} {} outside (0, 100)", name, value));
            }
        }
        if p.min_position_usd <= 0.0 || p.min_position_usd > p.max_position_usd {
            return invalid(format!(
                "position size bounds inverted: min {} max {}",
                p.min_position_usd, p.max_position_usd
            ));
        }
        if !(p.size_reduction_factor > 0.0 && p.size_reduction_factor <= 1.0) {
            return invalid("size_reduction_factor must be in (0, 1]".into());
        }
        if p.max_hold_minutes <= 0 || p.max_open_positions == 0 {
            return invalid("max_hold_minutes and max_open_positions must be positive".into());
        }
        if p.fee_rate < 0.0 {
            return invalid("fee_rate must be non-negative".into());
        }
        if p.stagnation_minutes < 0 || p.stagnation_low_percent > p.stagnation_high_percent {
            return invalid(format!(
                "stagnation band [{}, {}] after {} minutes is invalid",
                p.stagnation_low_percent, p.stagnation_high_percent, p.stagnation_minutes
            ));
        }
        if p.early_exit_enabled
            && (p.early_exit_after_minutes < 0
                || !(p.early_exit_rsi > 0.0 && p.early_exit_rsi < 100.0)
                || p.early_exit_max_pnl_percent > 0.0)
        {
            return invalid("early exit needs a non-negative delay, an RSI in (0, 100) and a loss threshold".into());
        }

        let r = &self.risk;
        if r.max_daily_trades == 0 || r.max_trades_per_hour == 0 || r.max_loss_streak == 0 {
            return invalid("trade caps and max_loss_streak must be positive".into());
        }
        if r.max_daily_loss_usd <= 0.0 {
            return invalid("max_daily_loss_usd must be positive".into());
        }
        if r.max_trades_per_pair_hour == 0 || r.daily_profit_target_usd < 0.0 {
            return invalid("max_trades_per_pair_hour must be positive and daily_profit_target_usd non-negative".into());
        }
        if r.trading_start_hour > 23 || r.trading_end_hour > 23 || r.trading_start_hour == r.trading_end_hour {
            return invalid(format!(
                "trading hours {}..{} must be distinct UTC hours",
                r.trading_start_hour, r.trading_end_hour
            ));
        }

        let sc = &self.screen;
        if sc.max_spread_pct < 0.0 || sc.min_volatility_pct < 0.0 {
            return invalid("screen thresholds must be non-negative".into());
        }

        if self.network.max_attempts == 0 || self.network.request_timeout_secs == 0 {
            return invalid("network retry policy needs at least one attempt and a timeout".into());
        }
        if self.network.requests_per_minute == 0 {
            return invalid("requests_per_minute must be positive".into());
        }
        if self.paper.starting_balance < 0.0 {
            return invalid("paper starting_balance must be non-negative".into());
        }

        Ok(())
    }

    /// Live trading needs exchange credentials on top of a valid config
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.binance.api_key.is_none() || self.binance.secret_key.is_none() {
            return Err(ConfigError::Invalid(
                "BINANCE_API_KEY and BINANCE_SECRET_KEY are required for live trading".into(),
            ));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.symbols.len(), 5);
        assert_eq!(settings.position.max_open_positions, 2);
        assert_eq!(settings.risk.max_loss_streak, 3);
    }

    #[test]
    fn test_exit_rules_convert_percentages() {
        let rules = PositionSettings::default().exit_rules();
        assert!((rules.take_profit_pct - 0.009).abs() < 1e-12);
        assert!((rules.stop_loss_pct - 0.004).abs() < 1e-12);
        assert_eq!(rules.max_hold, chrono::Duration::minutes(45));
        assert_eq!(rules.stagnation, Some(StagnationRule::default()));
        assert_eq!(rules.momentum_exit, Some(MomentumExitRule::default()));
    }

    #[test]
    fn test_zero_stagnation_minutes_disables_rule() {
        let position = PositionSettings {
            stagnation_minutes: 0,
            early_exit_enabled: false,
            ..PositionSettings::default()
        };
        let rules = position.exit_rules();
        assert!(rules.stagnation.is_none());
        assert!(rules.momentum_exit.is_none());
    }

    #[test]
    fn test_momentum_exit_uses_strategy_periods() {
        let mut settings = Settings::default();
        settings.strategy.rsi_period = 7;
        let rule = settings.exit_rules().momentum_exit.unwrap();
        assert_eq!(rule.rsi_period, 7);
        assert_eq!(rule.rsi_below, 25.0);
    }

    #[test]
    fn test_rejects_equal_trading_hours() {
        let mut settings = Settings::default();
        settings.risk.trading_start_hour = 8;
        settings.risk.trading_end_hour = 8;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_symbols() {
        let mut settings = Settings::default();
        settings.symbols.clear();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_inverted_position_bounds() {
        let mut settings = Settings::default();
        settings.position.min_position_usd = 600.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_short_candle_limit() {
        let mut settings = Settings::default();
        settings.candle_limit = 20;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_percent_out_of_range() {
        let mut settings = Settings::default();
        settings.position.stop_loss_percent = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_secrets_from_lookup() {
        let mut settings = Settings::default();
        settings.apply_secrets(|key| match key {
            "BINANCE_API_KEY" => Some("key".to_string()),
            "BINANCE_SECRET_KEY" => Some("secret".to_string()),
            "TELEGRAM_CHAT_ID" => Some("   ".to_string()),
            _ => None,
        });
        assert!(settings.require_credentials().is_ok());
        assert!(settings.telegram.chat_id.is_none());
    }

    #[test]
    fn test_live_requires_credentials() {
        let settings = Settings::default();
        assert!(settings.require_credentials().is_err());
    }

    #[test]
    fn test_secrets_never_serialized() {
        let mut settings = Settings::default();
        settings.apply_secrets(|_| Some("hunter2".to_string()));
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
