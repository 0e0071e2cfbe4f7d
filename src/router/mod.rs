// =============================================================================
// Order Router Resilience — spec §4.E
// =============================================================================
//
// Ported from `shared/order_router_resilience.py`'s `OrderRouterResilience`:
// classify the exchange's response, retry retryable errors with exponential
// backoff + jitter (honoring `Retry-After` when present), give up after a
// fixed attempt budget, and keep a capped ring buffer of retry history.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::now_secs_f64;

/// Retry/backoff tuning, mirroring `RetryConfig` in the original source.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    pub client_order_id: String,
    pub timestamp: i64,
}

fn default_order_type() -> String {
    "MARKET".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay_secs: f64,
    pub error: String,
    pub ts: f64,
}

/// Cap on the in-memory retry history ring buffer.
const MAX_RETRY_HISTORY: usize = 1000;

/// Something capable of actually placing an order with an exchange. Kept
/// abstract: the router's job is resilience, not transport. Return-position
/// `impl Future` keeps this trait allocation-free, which means it isn't
/// object-safe — callers take `&E` generically, never `&dyn OrderExecutor`.
pub trait OrderExecutor: Send + Sync {
    fn execute(&self, order: &OrderRequest) -> impl std::future::Future<Output = OrderResponse> + Send;
}


#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub orders_sent: u64,
    pub orders_success: u64,
    pub orders_failed: u64,
    pub retryable_errors: u64,
    pub non_retryable_errors: u64,
    pub total_retries: u64,
}

impl RouterStats {
    pub fn success_rate(&self) -> f64 {
        self.orders_success as f64 / self.orders_sent.max(1) as f64 * 100.0
    }

    pub fn retry_rate(&self) -> f64 {
        self.total_retries as f64 / self.orders_sent.max(1) as f64 * 100.0
    }
}

/// Classification of an error code into retryable vs. terminal, mirroring
/// `_analyze_error`.
fn analyze_error(response: &OrderResponse) -> (bool, Option<u64>) {
    let Some(code) = response.error_code.as_deref() else {
        return (false, None);
    };
    let code = code.to_uppercase();

    if code == "TIMEOUT" || code == "NETWORK_ERROR" {
        return (true, None);
    }
    if code == "HTTP_429" {
        return (true, Some(response.retry_after.unwrap_or(60)));
    }
    if code == "HTTP_503" {
        return (true, Some(response.retry_after.unwrap_or(30)));
    }
    if code.starts_with("HTTP_5") {
        return (true, response.retry_after);
    }
    if code == "INVALID_SYMBOL" || code == "INSUFFICIENT_BALANCE" || code == "INVALID_ORDER_PARAMS" {
        return (false, None);
    }
    if code.starts_with("HTTP_4") && code != "HTTP_429" {
        return (false, None);
    }
    (false, None)
}

/// Order routing with retry/backoff resilience, scoped to one process.
pub struct RouterResilience {
    config: RetryConfig,
    stats: RouterStats,
    retry_history: VecDeque<RetryAttempt>,
}

impl RouterResilience {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: RouterStats::default(),
            retry_history: VecDeque::new(),
        }
    }

    /// Route one order, retrying retryable failures up to
    /// `config.max_retries` times with exponential backoff + jitter.
    /// Terminal failures and exhausted retries both return the last
    /// response along with the attempts made.
    pub async fn route_order<E: OrderExecutor>(
        &mut self,
        order: &OrderRequest,
        executor: &E,
    ) -> (OrderResponse, Vec<RetryAttempt>) {
        self.stats.orders_sent += 1;
        let mut attempts = Vec::new();
        let mut last_response: Option<OrderResponse> = None;

        for attempt in 0..=self.config.max_retries {
            let response = executor.execute(order).await;

            if response.success {
                self.stats.orders_success += 1;
                info!(
                    status = "sent",
                    trace_id = %order.client_order_id,
                    coid = %order.client_order_id,
                    "order routed"
                );
                return (response, attempts);
            }

            let (retryable, retry_after) = analyze_error(&response);

            if !retryable || attempt >= self.config.max_retries {
                if retryable {
                    self.stats.retryable_errors += 1;
                } else {
                    self.stats.non_retryable_errors += 1;
                }
                self.stats.orders_failed += 1;
                error!(
                    status = "drop",
                    code = ?response.error_code,
                    trace_id = %order.client_order_id,
                    coid = %order.client_order_id,
                    "order dropped after routing"
                );
                return (response, attempts);
            }

            self.stats.retryable_errors += 1;
            self.stats.total_retries += 1;

            let delay = self.calculate_retry_delay(attempt, retry_after);
            let retry_attempt = RetryAttempt {
                attempt: attempt + 1,
                delay_secs: delay.as_secs_f64(),
                error: response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
                ts: now_secs_f64(),
            };
            self.push_retry_history(retry_attempt.clone());
            attempts.push(retry_attempt);

            warn!(
                status = "retry",
                code = ?response.error_code,
                trace_id = %order.client_order_id,
                coid = %order.client_order_id,
                attempt = attempt + 1,
                delay_secs = delay.as_secs_f64(),
                "retrying order"
            );

            tokio::time::sleep(delay).await;
            last_response = Some(response);
        }

        self.stats.orders_failed += 1;
        let response = last_response.unwrap_or(OrderResponse {
            success: false,
            error_code: Some("UNKNOWN".to_string()),
            ..Default::default()
        });
        (response, attempts)
    }

    fn calculate_retry_delay(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        if let Some(secs) = retry_after {
            return Duration::from_secs(secs);
        }

        let base = self.config.base_delay.as_secs_f64();
        let mut delay = base * self.config.backoff_multiplier.powi(attempt as i32);
        delay = delay.min(self.config.max_delay.as_secs_f64());

        if self.config.jitter {
            let jitter_fraction: f64 = rand::thread_rng().gen_range(0.1..0.3);
            delay += jitter_fraction * delay;
        }

        Duration::from_secs_f64(delay)
    }

    fn push_retry_history(&mut self, attempt: RetryAttempt) {
        self.retry_history.push_back(attempt);
        while self.retry_history.len() > MAX_RETRY_HISTORY {
            self.retry_history.pop_front();
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.clone()
    }

    pub fn recent_retry_attempts(&self, limit: usize) -> Vec<RetryAttempt> {
        self.retry_history.iter().rev().take(limit).rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedExecutor {
        responses: std::sync::Mutex<VecDeque<OrderResponse>>,
        calls: AtomicU32,
    }

    impl ScriptedExecutor {
        fn new(responses: Vec<OrderResponse>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl OrderExecutor for ScriptedExecutor {
        async fn execute(&self, _order: &OrderRequest) -> OrderResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(OrderResponse {
                    success: false,
                    error_code: Some("EXHAUSTED".to_string()),
                    ..Default::default()
                })
        }
    }

    fn order() -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            qty: 0.001,
            price: 67000.0,
            order_type: "MARKET".to_string(),
            client_order_id: "coid123".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt_records_no_retries() {
        let exec = ScriptedExecutor::new(vec![OrderResponse {
            success: true,
            order_id: Some("1".to_string()),
            ..Default::default()
        }]);
        let mut router = RouterResilience::new(RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        });
        let (response, attempts) = router.route_order(&order(), &exec).await;
        assert!(response.success);
        assert!(attempts.is_empty());
        assert_eq!(router.stats().orders_success, 1);
    }

    #[tokio::test]
    async fn retryable_error_then_success_records_one_retry() {
        let exec = ScriptedExecutor::new(vec![
            OrderResponse {
                success: false,
                error_code: Some("TIMEOUT".to_string()),
                error_message: Some("timed out".to_string()),
                ..Default::default()
            },
            OrderResponse {
                success: true,
                order_id: Some("2".to_string()),
                ..Default::default()
            },
        ]);
        let mut router = RouterResilience::new(RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        });
        let (response, attempts) = router.route_order(&order(), &exec).await;
        assert!(response.success);
        assert_eq!(attempts.len(), 1);
        assert_eq!(router.stats().total_retries, 1);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let exec = ScriptedExecutor::new(vec![OrderResponse {
            success: false,
            error_code: Some("INVALID_SYMBOL".to_string()),
            ..Default::default()
        }]);
        let mut router = RouterResilience::new(RetryConfig::default());
        let (response, attempts) = router.route_order(&order(), &exec).await;
        assert!(!response.success);
        assert!(attempts.is_empty());
        assert_eq!(router.stats().non_retryable_errors, 1);
    }

    #[tokio::test]
    async fn exhausting_retries_fails_after_max_attempts() {
        let exec = ScriptedExecutor::new(vec![
            OrderResponse {
                success: false,
                error_code: Some("HTTP_500".to_string()),
                ..Default::default()
            };
            4
        ]);
        let mut router = RouterResilience::new(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        });
        let (response, attempts) = router.route_order(&order(), &exec).await;
        assert!(!response.success);
        assert_eq!(attempts.len(), 3);
        assert_eq!(router.stats().orders_failed, 1);
    }

    #[test]
    fn rate_limit_retry_after_overrides_backoff() {
        let router = RouterResilience::new(RetryConfig::default());
        let delay = router.calculate_retry_delay(0, Some(60));
        assert_eq!(delay, Duration::from_secs(60));
    }
}
