// ===============================
// src/oracle.rs
// ===============================
//
// External judgement sources, injected into each agent:
// - SentimentOracle : (technical context, headlines) -> outlook + confidence
// - MlOracle        : feature row -> Up / Down
// - NewsSource      : symbol -> latest headlines
//
// Any failure here is non-fatal: the aggregator turns it into an Unknown
// signal and the confluence gate refuses to trade on it.
//
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::domain::{MlPrediction, Outlook, SentimentReading};
use crate::strategy::FeatureRow;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("unparseable oracle response: {0}")]
    Unparseable(String),
}

#[async_trait]
pub trait SentimentOracle: Send + Sync {
    async fn analyze(&self, technical_context: &str, headlines: &str) -> Result<SentimentReading, OracleError>;
}

#[async_trait]
pub trait MlOracle: Send + Sync {
    async fn predict(&self, features: &FeatureRow) -> Result<MlPrediction, OracleError>;
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn headlines(&self, symbol: &str, count: usize) -> Vec<String>;
}

/// Used when no endpoint is configured. Always Unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl SentimentOracle for Unconfigured {
    async fn analyze(&self, _: &str, _: &str) -> Result<SentimentReading, OracleError> {
        Err(OracleError::Unavailable("no sentiment endpoint configured".into()))
    }
}

#[async_trait]
impl MlOracle for Unconfigured {
    async fn predict(&self, _: &FeatureRow) -> Result<MlPrediction, OracleError> {
        Err(OracleError::Unavailable("no model endpoint configured".into()))
    }
}

#[async_trait]
impl NewsSource for Unconfigured {
    async fn headlines(&self, _: &str, _: usize) -> Vec<String> {
        Vec::new()
    }
}

pub fn parse_outlook(s: &str) -> Option<Outlook> {
    let norm: String = s
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match norm.as_str() {
        "stronglybearish" => Some(Outlook::StronglyBearish),
        "bearish" => Some(Outlook::Bearish),
        "neutral" => Some(Outlook::Neutral),
        "bullish" => Some(Outlook::Bullish),
        "stronglybullish" => Some(Outlook::StronglyBullish),
        _ => None,
    }
}

/// Decode `{"outlook": "...", "confidence": ...}`. A missing or non-numeric
/// confidence reads as 0.0; an unknown outlook is an error.
pub fn parse_sentiment(v: &Value) -> Result<SentimentReading, OracleError> {
    let raw = v
        .get("outlook")
        .and_then(Value::as_str)
        .ok_or_else(|| OracleError::Unparseable("missing outlook".into()))?;
    let outlook = parse_outlook(raw).ok_or_else(|| OracleError::Unparseable(format!("outlook {raw:?}")))?;

    let confidence = match v.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or_else(|_| {
            warn!(value = %s, "non-numeric confidence, using 0.0");
            0.0
        }),
        other => {
            warn!(?other, "missing confidence, using 0.0");
            0.0
        }
    };
    let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
    Ok(SentimentReading { outlook, confidence })
}

/// Decode `{"prediction": 1|0|"up"|"down"}`.
pub fn parse_prediction(v: &Value) -> Result<MlPrediction, OracleError> {
    match v.get("prediction") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(1) => Ok(MlPrediction::Up),
            Some(0) => Ok(MlPrediction::Down),
            _ => Err(OracleError::Unparseable(format!("prediction {n}"))),
        },
        Some(Value::Bool(b)) => Ok(if *b { MlPrediction::Up } else { MlPrediction::Down }),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "up" | "1" => Ok(MlPrediction::Up),
            "down" | "0" => Ok(MlPrediction::Down),
            _ => Err(OracleError::Unparseable(format!("prediction {s:?}"))),
        },
        _ => Err(OracleError::Unparseable("missing prediction".into())),
    }
}

/// POSTs JSON to an HTTP endpoint fronting the LLM / model.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    http: reqwest::Client,
    url: String,
}

impl HttpOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        Ok(Self { http, url: url.into() })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<Value, OracleError> {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OracleError::Unavailable(format!("status {}", resp.status())));
        }
        resp.json::<Value>().await.map_err(|e| OracleError::Unparseable(e.to_string()))
    }
}

#[async_trait]
impl SentimentOracle for HttpOracle {
    async fn analyze(&self, technical_context: &str, headlines: &str) -> Result<SentimentReading, OracleError> {
        let body = serde_json::json!({ "technical_context": technical_context, "headlines": headlines });
        let v = self.post(&body).await?;
        parse_sentiment(&v)
    }
}

#[async_trait]
impl MlOracle for HttpOracle {
    async fn predict(&self, features: &FeatureRow) -> Result<MlPrediction, OracleError> {
        let v = self.post(features).await?;
        parse_prediction(&v)
    }
}

#[derive(Debug, Deserialize)]
struct NewsItem {
    title: Option<String>,
}

/// GET `{base}/news?symbol=..` returning `[{"title": ..}, ..]`.
#[derive(Debug, Clone)]
pub struct HttpNews {
    http: reqwest::Client,
    base: String,
}

impl HttpNews {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        Ok(Self { http, base: base.into() })
    }
}

#[async_trait]
impl NewsSource for HttpNews {
    async fn headlines(&self, symbol: &str, count: usize) -> Vec<String> {
        let url = format!("{}/news", self.base.trim_end_matches('/'));
        let items = match self.http.get(&url).query(&[("symbol", symbol)]).send().await {
            Ok(r) => r.json::<Vec<NewsItem>>().await.unwrap_or_default(),
            Err(e) => {
                warn!(%symbol, ?e, "news fetch failed");
                return Vec::new();
            }
        };
        items
            .into_iter()
            .filter_map(|i| i.title)
            .filter(|t| !t.trim().is_empty())
            .take(count)
            .collect()
    }
}
