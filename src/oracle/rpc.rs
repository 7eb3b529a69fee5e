use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::OracleError;

/// Spaces calls evenly so at most `rate` start per `period`.
pub struct RateLimiter {
    interval: Duration,
    next: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rate: u32, period: Duration) -> Self {
        Self {
            interval: period / rate.max(1),
            next: Mutex::new(Instant::now()),
        }
    }

    pub fn per_second(rate: u32) -> Self {
        Self::new(rate, Duration::from_secs(1))
    }

    pub fn per_minute(rate: u32) -> Self {
        Self::new(rate, Duration::from_secs(60))
    }

    /// Waits for the next free slot and claims it.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Minimal JSON-RPC 2.0 client shared by the chain backends.
pub struct JsonRpcClient {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
    limiter: RateLimiter,
}

impl JsonRpcClient {
    pub fn new(url: &str, user: Option<&str>, pass: Option<&str>, requests_per_second: u32) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let auth = user.map(|user| STANDARD.encode(format!("{user}:{}", pass.unwrap_or_default())));
        Self {
            url: url.to_string(),
            client: Client::new(),
            auth,
            limiter: RateLimiter::per_second(requests_per_second),
        }
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, OracleError> {
        self.limiter.acquire().await;

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(auth) = &self.auth {
            request = request.header("Authorization", format!("Basic {auth}"));
        }

        let resp = request.send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(OracleError::RateLimited);
        }
        let json: Value = resp.json().await?;

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            return Err(OracleError::Rpc(err.clone()));
        }

        Ok(json["result"].clone())
    }
}

/// Decimal from a JSON number or string, accepting exponent notation.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Parses a `0x`-prefixed hex quantity.
pub fn hex_quantity(value: &Value) -> Option<u128> {
    let s = value.as_str()?;
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_from_json() {
        assert_eq!(decimal_from_json(&json!(0.5)), Some(Decimal::new(5, 1)));
        assert_eq!(decimal_from_json(&json!("12.25")), Some(Decimal::new(1225, 2)));
        assert_eq!(decimal_from_json(&json!(1e-8)), Some(Decimal::new(1, 8)));
        assert_eq!(decimal_from_json(&json!(null)), None);
    }

    #[test]
    fn hex_quantities() {
        assert_eq!(hex_quantity(&json!("0x1")), Some(1));
        assert_eq!(hex_quantity(&json!("0xde0b6b3a7640000")), Some(1_000_000_000_000_000_000));
        assert_eq!(hex_quantity(&json!("0x")), Some(0));
        assert_eq!(hex_quantity(&json!("12")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_calls() {
        let limiter = RateLimiter::per_second(4);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
