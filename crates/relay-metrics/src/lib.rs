use chrono::{DateTime, Utc};
use relay_core::{ErrorKind, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

pub struct TokenTracker {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    model_stats: RwLock<HashMap<String, ModelTokenStats>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokenStats {
    pub model_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self {
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            model_stats: RwLock::new(HashMap::new()),
        }
    }

    /// Adds the usage reported for one completion by `model`.
    pub fn record(&self, usage: &TokenUsage, model: &str) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);

        let mut stats = self
            .model_stats
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let model_stat = stats
            .entry(model.to_string())
            .or_insert_with(|| ModelTokenStats {
                model_id: model.to_string(),
                ..Default::default()
            });
        model_stat.prompt_tokens += usage.prompt_tokens;
        model_stat.completion_tokens += usage.completion_tokens;
        model_stat.total_tokens += usage.total_tokens;
        model_stat.requests += 1;
    }

    pub fn get_stats(&self) -> TokenUsage {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn get_model_stats(&self) -> HashMap<String, ModelTokenStats> {
        self.model_stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
        self.model_stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome and latency of every relay round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsCollector {
    pub requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: u64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub failures_by_kind: HashMap<ErrorKind, u64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.record_latency(latency);
        self.successful_requests += 1;
    }

    pub fn record_failure(&mut self, latency: Duration, kind: ErrorKind) {
        self.record_latency(latency);
        self.failed_requests += 1;
        *self.failures_by_kind.entry(kind).or_insert(0) += 1;
    }

    fn record_latency(&mut self, latency: Duration) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.requests += 1;
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency_ms);
        self.min_latency_ms = Some(self.min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
        self.last_latency_ms = Some(latency_ms);
        debug!("Recorded relay latency {}ms", latency_ms);
    }

    pub fn get_average_latency(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }

    pub fn get_success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.requests as f64 * 100.0
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_requests: self.requests,
            success_rate: self.get_success_rate(),
            average_latency_ms: self.get_average_latency(),
            last_latency_ms: self.last_latency_ms,
            uptime_seconds: self
                .started_at
                .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub last_latency_ms: Option<u64>,
    pub uptime_seconds: u64,
}
