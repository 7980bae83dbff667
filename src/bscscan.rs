//! BscScan account API client.
//!
//! Implements the tracer's fetch capability against the explorer API:
//! - Pagination by `startblock` until an empty page
//! - Rate limiting (the API caps free keys at 5 req/s)
//! - Bounded exponential backoff on rate-limit, 5xx and network errors
//! - Tolerant row parsing and deduplication across the three transfer actions

use crate::config::RateLimitConfig;
use crate::schemas::{TransferKind, TransferRecord};
use crate::trace::{FetchError, TransferFetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decimals of the chain's native coin
const NATIVE_DECIMALS: u32 = 18;

/// Response envelope shared by every account action
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

/// One row of `txlist`, `txlistinternal` or `tokentx`, every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiTransfer {
    pub hash: Option<String>,
    pub block_number: Option<String>,
    pub time_stamp: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub token_symbol: Option<String>,
    pub token_decimal: Option<String>,
}

/// Outcome of one response body
#[derive(Debug)]
enum Page {
    Rows(Vec<Value>),
    End,
    RateLimited(String),
}

/// Rate-limited BscScan client.
pub struct BscScanClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    config: RateLimitConfig,
}

impl BscScanClient {
    pub fn new(
        base_url: String,
        api_key: String,
        config: RateLimitConfig,
    ) -> Result<Self, FetchError> {
        let quota = Quota::per_second(NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN));
        let rate_limiter = RateLimiter::direct(quota);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            rate_limiter,
            config,
        })
    }

    /// URL of one page of `action` for `address`, ascending from `start_block`
    pub fn build_url(&self, action: &str, address: &str, start_block: u64) -> String {
        format!(
            "{}?module=account&action={}&address={}&startblock={}&sort=asc&apikey={}",
            self.base_url, action, address, start_block, self.api_key
        )
    }

    /// Request one page, retrying transient failures with exponential backoff.
    ///
    /// `None` means the API has no more rows for this action.
    async fn get_page(&self, action: &str, url: &str) -> Result<Option<Vec<Value>>, FetchError> {
        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let attempts = self.config.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.rate_limiter.until_ready().await;

            match self.client.get(url).send().await {
                Err(e) => {
                    last_error = format!("network error: {}", e.without_url());
                }
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = format!("HTTP {}", status);
                    } else if !status.is_success() {
                        return Err(FetchError::Api(format!("HTTP {} on {}", status, action)));
                    } else {
                        match response.json::<ApiResponse>().await {
                            Ok(body) => match classify_response(body)? {
                                Page::Rows(rows) => return Ok(Some(rows)),
                                Page::End => return Ok(None),
                                Page::RateLimited(message) => last_error = message,
                            },
                            Err(e) => last_error = format!("malformed body: {}", e.without_url()),
                        }
                    }
                }
            }

            if attempt < attempts {
                warn!(
                    "[attempt {}/{}] {} failed: {}; retrying in {:?}",
                    attempt, attempts, action, last_error, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// Fetch every page of one action for `address`.
    pub async fn fetch_all(
        &self,
        kind: TransferKind,
        address: &str,
    ) -> Result<Vec<TransferRecord>, FetchError> {
        let action = kind.action();
        let mut start_block = 0u64;
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for page in 0..self.config.max_pages {
            let url = self.build_url(action, address, start_block);
            let Some(rows) = self.get_page(action, &url).await? else {
                break;
            };

            let last_block = rows
                .last()
                .and_then(|row| row.get("blockNumber"))
                .and_then(Value::as_str)
                .and_then(|s| s.trim().parse::<u64>().ok());

            let page_len = rows.len();
            for row in rows {
                match serde_json::from_value::<ApiTransfer>(row) {
                    Ok(raw) => match parse_transfer(raw, kind) {
                        Some(record) => records.push(record),
                        None => skipped += 1,
                    },
                    Err(_) => skipped += 1,
                }
            }

            debug!(
                "{} {} page {}: {} rows (total so far: {})",
                address,
                action,
                page + 1,
                page_len,
                records.len()
            );

            match last_block {
                Some(block) => start_block = block + 1,
                None => {
                    warn!(
                        "{} {}: last row has no block number, stopping pagination",
                        address, action
                    );
                    break;
                }
            }

            if page + 1 == self.config.max_pages {
                warn!(
                    "{} {} hit pagination safety limit ({} pages, {} transfers). Some transfers may be missing.",
                    address,
                    action,
                    self.config.max_pages,
                    records.len()
                );
            }
        }

        if skipped > 0 {
            warn!("{} {}: skipped {} malformed rows", address, action, skipped);
        }

        Ok(records)
    }

    /// Normal, internal and token transfers of `address`, deduplicated
    pub async fn get_transactions(&self, address: &str) -> Result<Vec<TransferRecord>, FetchError> {
        let mut all = Vec::new();
        for kind in TransferKind::ALL {
            all.extend(self.fetch_all(kind, address).await?);
        }

        let records = dedupe_transfers(all);
        info!("Fetched {} transfers for {}", records.len(), address);
        Ok(records)
    }
}

#[async_trait]
impl TransferFetcher for BscScanClient {
    async fn fetch(&self, address: &str) -> Result<Vec<TransferRecord>, FetchError> {
        self.get_transactions(address).await
    }
}

/// Interpret the API envelope.
///
/// The API reports "no data" and errors alike with `status = "0"`; only the
/// shape of `result` and the message tell them apart.
fn classify_response(body: ApiResponse) -> Result<Page, FetchError> {
    match body.result {
        Value::Array(rows) if rows.is_empty() => Ok(Page::End),
        Value::Array(rows) => Ok(Page::Rows(rows)),
        other => {
            let detail = match other {
                Value::String(s) => s,
                Value::Null => String::new(),
                v => v.to_string(),
            };
            let text = format!("{} {}", body.message, detail).to_lowercase();

            if text.contains("no transactions found") || text.contains("no records found") {
                Ok(Page::End)
            } else if text.contains("rate limit") {
                Ok(Page::RateLimited(format!("{}: {}", body.message, detail)))
            } else {
                Err(FetchError::Api(format!("{}: {}", body.message, detail)))
            }
        }
    }
}

/// Convert one raw API row into a transfer record.
///
/// Rows without a hash or sender are rejected. A missing recipient is kept as
/// an empty string. An unparsable amount becomes zero.
pub fn parse_transfer(raw: ApiTransfer, kind: TransferKind) -> Option<TransferRecord> {
    let hash = raw.hash.filter(|h| !h.trim().is_empty())?;
    let from = raw.from.filter(|f| !f.trim().is_empty())?;

    let decimals = match kind {
        TransferKind::Token => raw
            .token_decimal
            .as_deref()
            .and_then(|d| d.trim().parse::<u32>().ok())
            .filter(|d| *d <= 77)
            .unwrap_or(NATIVE_DECIMALS),
        _ => NATIVE_DECIMALS,
    };

    Some(TransferRecord {
        hash,
        from,
        to: raw.to.unwrap_or_default(),
        value: native_value(raw.value.as_deref(), decimals),
        kind,
        block_number: raw.block_number.and_then(|b| b.trim().parse().ok()),
        timestamp: raw
            .time_stamp
            .and_then(|t| t.trim().parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        token_symbol: raw.token_symbol.filter(|s| !s.is_empty()),
    })
}

/// Base-unit integer string to native units; unparsable input is zero
fn native_value(raw: Option<&str>, decimals: u32) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v / 10f64.powi(decimals as i32))
        .unwrap_or(0.0)
}

/// Drop records whose dedup key was already seen, keeping the first
pub fn dedupe_transfers(records: Vec<TransferRecord>) -> Vec<TransferRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.dedup_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client() -> BscScanClient {
        BscScanClient::new(
            "https://api.bscscan.com/api".to_string(),
            "KEY".to_string(),
            RateLimitConfig::default(),
        )
        .unwrap()
    }

    /// Local HTTP endpoint answering each request with the next scripted
    /// `(status, body)`, repeating the last one once the script runs out.
    /// Returns the base URL and the request targets it received.
    async fn scripted_server(script: Vec<(u16, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };

                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let target = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                seen.lock().unwrap().push(target);

                let (code, body) = &script[served.min(script.len() - 1)];
                served += 1;
                let reason = if *code == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    code,
                    reason,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (base_url, requests)
    }

    fn fast_limits() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 1000,
            max_retries: 1,
            base_delay_ms: 1,
            ..RateLimitConfig::default()
        }
    }

    fn local_client(base_url: String, config: RateLimitConfig) -> BscScanClient {
        BscScanClient::new(base_url, "KEY".to_string(), config).unwrap()
    }

    fn rows_body(rows: serde_json::Value) -> (u16, String) {
        (200, json!({ "status": "1", "message": "OK", "result": rows }).to_string())
    }

    fn end_body() -> (u16, String) {
        (
            200,
            json!({ "status": "0", "message": "No transactions found", "result": [] }).to_string(),
        )
    }

    fn row(hash: &str, block: u64) -> serde_json::Value {
        json!({
            "blockNumber": block.to_string(),
            "timeStamp": "1704067200",
            "hash": hash,
            "from": "0xa",
            "to": "0xb",
            "value": "1000000000000000000"
        })
    }

    fn raw(value: serde_json::Value) -> ApiTransfer {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_build_url() {
        let url = client().build_url("txlist", "0xabc", 42);
        assert_eq!(
            url,
            "https://api.bscscan.com/api?module=account&action=txlist&address=0xabc&startblock=42&sort=asc&apikey=KEY"
        );
    }

    #[test]
    fn test_parse_normal_transfer() {
        let record = parse_transfer(
            raw(json!({
                "blockNumber": "123",
                "timeStamp": "1704067200",
                "hash": "0xh1",
                "from": "0xAAA",
                "to": "0xBBB",
                "value": "1500000000000000000",
                "gas": "21000",
                "isError": "0"
            })),
            TransferKind::Normal,
        )
        .unwrap();

        assert_eq!(record.hash, "0xh1");
        assert_eq!(record.from, "0xAAA");
        assert_eq!(record.to, "0xBBB");
        assert!((record.value - 1.5).abs() < 1e-12);
        assert_eq!(record.block_number, Some(123));
        assert_eq!(
            record.timestamp.map(|t| t.to_rfc3339()),
            Some("2024-01-01T00:00:00+00:00".to_string())
        );
        assert_eq!(record.kind, TransferKind::Normal);
    }

    #[test]
    fn test_parse_token_transfer_uses_token_decimals() {
        let record = parse_transfer(
            raw(json!({
                "hash": "0xh2",
                "from": "0xa",
                "to": "0xb",
                "value": "2500000",
                "tokenSymbol": "USDT",
                "tokenDecimal": "6"
            })),
            TransferKind::Token,
        )
        .unwrap();

        assert!((record.value - 2.5).abs() < 1e-12);
        assert_eq!(record.token_symbol.as_deref(), Some("USDT"));
    }

    #[test]
    fn test_parse_tolerates_bad_fields() {
        let record = parse_transfer(
            raw(json!({ "hash": "0xh3", "from": "0xa", "value": "not-a-number", "timeStamp": "soon" })),
            TransferKind::Internal,
        )
        .unwrap();

        assert_eq!(record.value, 0.0);
        assert_eq!(record.to, "");
        assert!(record.timestamp.is_none());
        assert!(record.block_number.is_none());
    }

    #[test]
    fn test_parse_rejects_rows_without_sender_or_hash() {
        assert!(parse_transfer(raw(json!({ "hash": "0xh4", "to": "0xb" })), TransferKind::Normal).is_none());
        assert!(parse_transfer(raw(json!({ "from": "0xa", "to": "0xb" })), TransferKind::Normal).is_none());
        assert!(parse_transfer(raw(json!({ "hash": " ", "from": "0xa" })), TransferKind::Normal).is_none());
    }

    #[test]
    fn test_classify_response() {
        let page = |v: serde_json::Value| classify_response(serde_json::from_value(v).unwrap());

        assert!(matches!(
            page(json!({ "status": "1", "message": "OK", "result": [{ "blockNumber": "1" }] })),
            Ok(Page::Rows(rows)) if rows.len() == 1
        ));
        assert!(matches!(
            page(json!({ "status": "0", "message": "No transactions found", "result": [] })),
            Ok(Page::End)
        ));
        assert!(matches!(
            page(json!({ "status": "0", "message": "NOTOK", "result": "Max rate limit reached" })),
            Ok(Page::RateLimited(_))
        ));
        assert!(matches!(
            page(json!({ "status": "0", "message": "NOTOK", "result": "error" })),
            Err(FetchError::Api(_))
        ));
    }

    #[test]
    fn test_dedupe_transfers() {
        let normal = TransferRecord::new("0xh", "0xa", "0xb", 1.0);
        let mut token = normal.clone();
        token.kind = TransferKind::Token;
        let mut upper = normal.clone();
        upper.hash = "0xH".to_string();

        let records = dedupe_transfers(vec![normal, token, upper]);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_all_paginates_from_last_block() {
        let (base_url, requests) = scripted_server(vec![
            rows_body(json!([row("0xh1", 1)])),
            rows_body(json!([row("0xh2", 5), row("0xh3", 7)])),
            end_body(),
        ])
        .await;

        let records = local_client(base_url, fast_limits())
            .fetch_all(TransferKind::Normal, "0xa")
            .await
            .unwrap();

        let hashes: Vec<&str> = records.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xh1", "0xh2", "0xh3"]);

        let requests = requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].contains("action=txlist&address=0xa&startblock=0&"));
        assert!(requests[1].contains("startblock=2&"));
        assert!(requests[2].contains("startblock=8&"));
    }

    #[tokio::test]
    async fn test_fetch_all_stops_at_page_limit() {
        let (base_url, requests) = scripted_server(vec![rows_body(json!([row("0xh1", 1)]))]).await;
        let config = RateLimitConfig {
            max_pages: 2,
            ..fast_limits()
        };

        let records = local_client(base_url, config)
            .fetch_all(TransferKind::Normal, "0xa")
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_all_reports_api_error() {
        let (base_url, requests) = scripted_server(vec![(
            200,
            json!({ "status": "0", "message": "NOTOK", "result": "error" }).to_string(),
        )])
        .await;

        let result = local_client(base_url, fast_limits())
            .fetch_all(TransferKind::Normal, "0xa")
            .await;

        assert!(matches!(result, Err(FetchError::Api(_))));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_status_is_not_retried() {
        let (base_url, requests) = scripted_server(vec![(400, "{}".to_string())]).await;

        let result = local_client(base_url, fast_limits())
            .fetch_all(TransferKind::Token, "0xa")
            .await;

        assert!(matches!(result, Err(FetchError::Api(_))));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_429_exhausts_retries() {
        let (base_url, requests) = scripted_server(vec![(429, "{}".to_string())]).await;

        let result = local_client(base_url, fast_limits())
            .fetch_all(TransferKind::Normal, "0xa")
            .await;

        assert!(matches!(
            result,
            Err(FetchError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_message_is_retried() {
        let (base_url, requests) = scripted_server(vec![
            (
                200,
                json!({ "status": "0", "message": "NOTOK", "result": "Max rate limit reached" })
                    .to_string(),
            ),
            (503, "{}".to_string()),
            rows_body(json!([row("0xh1", 3)])),
            end_body(),
        ])
        .await;
        let config = RateLimitConfig {
            max_retries: 2,
            ..fast_limits()
        };

        let records = local_client(base_url, config)
            .fetch_all(TransferKind::Normal, "0xa")
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        let requests = requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 4);
        assert!(requests[2].contains("startblock=0&"));
        assert!(requests[3].contains("startblock=4&"));
    }

    #[tokio::test]
    async fn test_get_transactions_queries_every_action() {
        let (base_url, requests) =
            scripted_server(vec![rows_body(json!([row("0xh1", 1)])), end_body()]).await;

        let records = local_client(base_url, fast_limits())
            .get_transactions("0xa")
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        let requests = requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 4);
        assert!(requests[1].contains("action=txlist&") && requests[1].contains("startblock=2&"));
        assert!(requests[2].contains("action=txlistinternal&"));
        assert!(requests[3].contains("action=tokentx&"));
    }
}
