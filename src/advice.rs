// 14.0 advice.rs: end-of-day performance note for each participant.
// the text comes from an external text-generation service; the result is stored
// verbatim. a template generator stands in when no endpoint is configured.

use crate::config::AdviceConfig;
use crate::entry::{return_percent, EntryBook};
use crate::types::{Level, UserId};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// What the generator gets to see about one participant's day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub user_id: UserId,
    pub level: Level,
    pub date: NaiveDate,
    pub return_percent: Decimal,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub max_lot: Decimal,
    // None when the level rolled over
    pub rank: Option<u32>,
    pub participants: usize,
}

impl PerformanceSummary {
    pub fn from_book(book: &EntryBook, date: NaiveDate, rank: Option<u32>, participants: usize) -> Self {
        let closed: Vec<_> = book.closed_on(date).collect();
        let wins = closed
            .iter()
            .filter(|p| p.current_pnl.map(|pnl| pnl > Decimal::ZERO).unwrap_or(false))
            .count();
        let losses = closed
            .iter()
            .filter(|p| p.current_pnl.map(|pnl| pnl < Decimal::ZERO).unwrap_or(false))
            .count();

        Self {
            user_id: book.entry.user_id,
            level: book.entry.level,
            date,
            return_percent: return_percent(book.entry.virtual_capital, book.entry.initial_capital)
                .round_dp(2),
            trades: closed.len(),
            wins,
            losses,
            max_lot: book
                .positions
                .iter()
                .map(|p| p.lot_size)
                .max()
                .unwrap_or(Decimal::ZERO),
            rank,
            participants,
        }
    }

    pub fn prompt(&self) -> String {
        let rank = match self.rank {
            Some(rank) => format!("finished rank {} of {}", rank, self.participants),
            None => "the competition rolled over, no ranking".to_string(),
        };
        format!(
            "Daily {} competition on {}: return {}%, {} trades ({} won, {} lost), largest lot {}, {}. \
             Give two sentences of practical trading advice.",
            self.level, self.date, self.return_percent, self.trades, self.wins, self.losses, self.max_lot, rank
        )
    }
}

#[async_trait]
pub trait AdviceGenerator: Send + Sync {
    async fn generate(&self, summary: &PerformanceSummary) -> Result<String>;
}

/// Fixed wording from the numbers alone. Never fails.
#[derive(Debug, Clone, Default)]
pub struct TemplateAdvice;

#[async_trait]
impl AdviceGenerator for TemplateAdvice {
    async fn generate(&self, summary: &PerformanceSummary) -> Result<String> {
        let opening = if summary.trades == 0 {
            "No trades closed today; sitting out is a position too, but the prize needs activity.".to_string()
        } else if summary.return_percent > Decimal::ZERO {
            format!(
                "Up {}% across {} trades ({} winners).",
                summary.return_percent, summary.trades, summary.wins
            )
        } else {
            format!(
                "Down {}% across {} trades ({} losers).",
                summary.return_percent.abs(),
                summary.trades,
                summary.losses
            )
        };
        let sizing = if summary.max_lot >= Decimal::new(5, 1) {
            "Your largest lot was heavy; set a stop loss before sizing up."
        } else {
            "Keep sizing consistent and let take-profit targets do the work."
        };
        Ok(format!("{opening} {sizing}"))
    }
}

/// Chat-completion style HTTP call.
#[derive(Debug, Clone)]
pub struct HttpAdviceGenerator {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl HttpAdviceGenerator {
    pub fn new(config: &AdviceConfig, endpoint: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    fn request_body(&self, summary: &PerformanceSummary) -> Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": "You are a concise trading coach."},
                {"role": "user", "content": summary.prompt()},
            ],
        })
    }
}

fn extract_content(body: &Value) -> Option<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl AdviceGenerator for HttpAdviceGenerator {
    async fn generate(&self, summary: &PerformanceSummary) -> Result<String> {
        let mut req = self.http.post(&self.endpoint).json(&self.request_body(summary));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.context("advice request")?;
        if !resp.status().is_success() {
            return Err(anyhow!("advice endpoint status={}", resp.status()));
        }
        let body = resp.json::<Value>().await.context("parse advice response")?;
        extract_content(&body).ok_or_else(|| anyhow!("advice response has no content"))
    }
}

/// HTTP generator when an endpoint is configured, template otherwise.
pub fn generator_from_config(config: &AdviceConfig) -> Arc<dyn AdviceGenerator> {
    match &config.endpoint {
        Some(endpoint) => Arc::new(HttpAdviceGenerator::new(config, endpoint.clone())),
        None => Arc::new(TemplateAdvice),
    }
}
