// 7.0 config.rs: all settings in one place. levels, trading limits, schedule, feed, advice.
// 7.1 env overrides at the bottom. variable names are ARENA_*.

use crate::types::{Level, Quote, Symbol};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

// Money side of one competition level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    // Virtual bankroll every entry starts the day with
    pub initial_capital: Quote,
    // What a participant pays to enter
    pub entry_price: Quote,
    // House cut per participant, taken out of the pool
    pub commission: Quote,
}

impl LevelConfig {
    pub fn new(initial_capital: Decimal, entry_price: Decimal, commission: Decimal) -> Self {
        Self {
            initial_capital: Quote::new(initial_capital),
            entry_price: Quote::new(entry_price),
            commission: Quote::new(commission),
        }
    }

    // n*entry - n*commission
    pub fn prize_pool(&self, participants: usize) -> Quote {
        let n = Decimal::from(participants);
        Quote::new(n * self.entry_price.value() - n * self.commission.value())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTable {
    pub basic: LevelConfig,
    pub medium: LevelConfig,
    pub premium: LevelConfig,
}

impl LevelTable {
    pub fn get(&self, level: Level) -> &LevelConfig {
        match level {
            Level::Basic => &self.basic,
            Level::Medium => &self.medium,
            Level::Premium => &self.premium,
        }
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        Self {
            basic: LevelConfig::new(dec!(10000), dec!(10), dec!(2)),
            medium: LevelConfig::new(dec!(50000), dec!(25), dec!(5)),
            premium: LevelConfig::new(dec!(100000), dec!(50), dec!(10)),
        }
    }
}

/** 7.2: per-entry trading limits */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingLimits {
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    // lots must be a multiple of this
    pub lot_step: Decimal,
    // sum of open lots per entry
    pub max_open_lot: Decimal,
    // positions opened per entry per UTC day
    pub max_positions_per_day: usize,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            min_lot: dec!(0.01),
            max_lot: dec!(1.0),
            lot_step: dec!(0.01),
            max_open_lot: dec!(1.0),
            max_positions_per_day: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementConfig {
    // fewer confirmed entries than this rolls the level over
    pub min_participants: usize,
    // share of the pool per rank, best first
    pub prize_shares: Vec<Decimal>,
    // extra attempts for a level that fails to settle
    pub retries: u32,
    // daily UTC run time
    pub run_at: NaiveTime,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            min_participants: 5,
            prize_shares: vec![dec!(0.50), dec!(0.30), dec!(0.20)],
            retries: 2,
            run_at: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

// External instrument name and the canonical symbol it maps to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub external: String,
    pub symbol: Symbol,
}

impl InstrumentConfig {
    pub fn new(external: &str, symbol: &str) -> Self {
        Self {
            external: external.to_string(),
            symbol: Symbol::from(symbol),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub token: Option<String>,
    pub reconnect_secs: u64,
    pub instruments: Vec<InstrumentConfig>,
}

impl FeedConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.finnhub.io".to_string(),
            token: None,
            reconnect_secs: 5,
            instruments: vec![
                InstrumentConfig::new("OANDA:EUR_USD", "EURUSD"),
                InstrumentConfig::new("OANDA:GBP_USD", "GBPUSD"),
                InstrumentConfig::new("OANDA:USD_JPY", "USDJPY"),
                InstrumentConfig::new("OANDA:XAU_USD", "XAUUSD"),
                InstrumentConfig::new("BINANCE:BTCUSDT", "BTCUSD"),
                InstrumentConfig::new("BINANCE:ETHUSDT", "ETHUSD"),
            ],
        }
    }
}

// Text-generation endpoint for the daily performance note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceConfig {
    // None = use the built-in template
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for AdviceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 20,
            max_tokens: 160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub levels: LevelTable,
    pub limits: TradingLimits,
    pub settlement: SettlementConfig,
    pub feed: FeedConfig,
    pub advice: AdviceConfig,
    pub broadcast_interval_ms: u64,
    // audit events kept in memory
    pub max_events: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            levels: LevelTable::default(),
            limits: TradingLimits::default(),
            settlement: SettlementConfig::default(),
            feed: FeedConfig::default(),
            advice: AdviceConfig::default(),
            broadcast_interval_ms: 1_000,
            max_events: 100_000,
        }
    }
}

impl ArenaConfig {
    // Local runs: small threshold so a handful of test users can settle
    pub fn development() -> Self {
        let mut config = Self::default();
        config.settlement.min_participants = 3;
        config.feed.reconnect_secs = 2;
        config.max_events = 10_000;
        config
    }

    pub fn production() -> Self {
        Self::default()
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn level(&self, level: Level) -> &LevelConfig {
        self.levels.get(level)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        for level in Level::ALL {
            let cfg = self.levels.get(level);
            if cfg.initial_capital.value() <= Decimal::ZERO {
                return Err(ConfigError::InvalidLevel {
                    level,
                    reason: "initial capital must be positive".to_string(),
                });
            }
            if cfg.entry_price.is_negative() || cfg.commission.is_negative() {
                return Err(ConfigError::InvalidLevel {
                    level,
                    reason: "entry price and commission cannot be negative".to_string(),
                });
            }
            if cfg.commission > cfg.entry_price {
                return Err(ConfigError::InvalidLevel {
                    level,
                    reason: "commission exceeds entry price".to_string(),
                });
            }
        }

        let limits = &self.limits;
        if limits.min_lot <= Decimal::ZERO || limits.min_lot > limits.max_lot {
            return Err(ConfigError::InvalidLimits {
                reason: "lot bounds must satisfy 0 < min <= max".to_string(),
            });
        }
        if limits.lot_step <= Decimal::ZERO {
            return Err(ConfigError::InvalidLimits {
                reason: "lot step must be positive".to_string(),
            });
        }
        if limits.max_open_lot < limits.max_lot {
            return Err(ConfigError::InvalidLimits {
                reason: "max open lot below max single lot".to_string(),
            });
        }
        if limits.max_positions_per_day == 0 {
            return Err(ConfigError::InvalidLimits {
                reason: "daily position cap must be at least 1".to_string(),
            });
        }

        let shares: Decimal = self.settlement.prize_shares.iter().sum();
        if self.settlement.prize_shares.iter().any(|s| *s < Decimal::ZERO) || shares > Decimal::ONE {
            return Err(ConfigError::InvalidSettlement {
                reason: "prize shares must be non-negative and sum to at most 1".to_string(),
            });
        }
        if self.settlement.min_participants == 0 {
            return Err(ConfigError::InvalidSettlement {
                reason: "participation threshold must be at least 1".to_string(),
            });
        }

        if self.feed.instruments.is_empty() {
            return Err(ConfigError::InvalidFeed {
                reason: "no instruments configured".to_string(),
            });
        }
        if self.broadcast_interval_ms == 0 {
            return Err(ConfigError::InvalidSchedule {
                reason: "broadcast interval must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Preset picked by `ARENA_ENV`, then individual `ARENA_*` overrides.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            var(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let environment = get("ARENA_ENV")
            .and_then(|s| Environment::parse(&s))
            .unwrap_or(Environment::Development);
        let mut config = environment.config();

        if let Some(url) = get("ARENA_FEED_URL") {
            config.feed.url = url;
        }
        if let Some(token) = get("ARENA_FEED_TOKEN") {
            config.feed.token = Some(token);
        }
        if let Some(secs) = get("ARENA_FEED_RECONNECT_SECS").and_then(|s| s.parse().ok()) {
            config.feed.reconnect_secs = secs;
        }
        if let Some(ms) = get("ARENA_BROADCAST_MS").and_then(|s| s.parse().ok()) {
            config.broadcast_interval_ms = ms;
        }
        if let Some(n) = get("ARENA_MIN_PARTICIPANTS").and_then(|s| s.parse().ok()) {
            config.settlement.min_participants = n;
        }
        if let Some(at) = get("ARENA_SETTLEMENT_TIME")
            .and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M").ok())
        {
            config.settlement.run_at = at;
        }
        if let Some(endpoint) = get("ARENA_ADVICE_ENDPOINT") {
            config.advice.endpoint = Some(endpoint);
        }
        if let Some(key) = get("ARENA_ADVICE_API_KEY") {
            config.advice.api_key = Some(key);
        }
        if let Some(model) = get("ARENA_ADVICE_MODEL") {
            config.advice.model = model;
        }

        config
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("level {level}: {reason}")]
    InvalidLevel { level: Level, reason: String },
    #[error("limits: {reason}")]
    InvalidLimits { reason: String },
    #[error("settlement: {reason}")]
    InvalidSettlement { reason: String },
    #[error("feed: {reason}")]
    InvalidFeed { reason: String },
    #[error("schedule: {reason}")]
    InvalidSchedule { reason: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dev" | "development" => Some(Environment::Development),
            "prod" | "production" => Some(Environment::Production),
            _ => None,
        }
    }

    pub fn config(&self) -> ArenaConfig {
        match self {
            Environment::Development => ArenaConfig::development(),
            Environment::Production => ArenaConfig::production(),
        }
    }
}
