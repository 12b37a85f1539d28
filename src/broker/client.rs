// =============================================================================
// KIS REST client — bearer-token signed requests
// =============================================================================
//
// Ported from the original `tools/order_executor.py`: same endpoint set, same
// body field names (CANO/ACNT_PRDT_CD/PDNO/ORD_DVSN/ORD_QTY/ORD_UNPR), same
// TR-ID pairs for paper vs live mode, same pool/retry shape (reqwest's
// connection pool replaces `HTTPAdapter(pool_maxsize=20)`; retries on
// 429/5xx replace `Retry(total=3, backoff_factor=0.4)`).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::config::BrokerEnv;
use crate::errors::{CoreError, CoreResult};
use crate::tick_table::limit_price;
use crate::types::{AccountMode, BalanceSnapshot, Bar, BrokerPosition, OrderStatus, OrderStatusSnapshot};

use super::auth::TokenStore;
use super::rate_limit::TokenBucket;

/// TR-IDs switch together with the account mode (spec §6).
struct TrIds {
    buy: &'static str,
    sell: &'static str,
    cancel: &'static str,
    balance: &'static str,
    orders: &'static str,
}

fn tr_ids(mode: AccountMode) -> TrIds {
    match mode {
        AccountMode::Paper => TrIds {
            buy: "VTTC0802U",
            sell: "VTTC0801U",
            cancel: "VTTC0803U",
            balance: "VTTC8434R",
            orders: "VTTC8036R",
        },
        AccountMode::Live => TrIds {
            buy: "TTTC0802U",
            sell: "TTTC0801U",
            cancel: "TTTC0803U",
            balance: "TTTC8434R",
            orders: "TTTC8036R",
        },
    }
}

pub struct KisClient {
    env: BrokerEnv,
    http: reqwest::Client,
    tokens: Arc<TokenStore>,
    rate_limiter: Arc<TokenBucket>,
    rate_limit_timeout: Duration,
    max_retries: u32,
    backoff_factor: f64,
}

impl KisClient {
    pub fn new(
        env: BrokerEnv,
        token_cache_path: impl Into<std::path::PathBuf>,
        rate_limiter: Arc<TokenBucket>,
        rate_limit_timeout: Duration,
        http_timeout: Duration,
        max_retries: u32,
        backoff_factor: f64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .pool_max_idle_per_host(20)
            .build()
            .expect("failed to build reqwest client");

        Self {
            env,
            http,
            tokens: Arc::new(TokenStore::new(token_cache_path)),
            rate_limiter,
            rate_limit_timeout,
            max_retries,
            backoff_factor,
        }
    }

    async fn access_token(&self) -> CoreResult<String> {
        let env = &self.env;
        let http = self.http.clone();
        self.tokens
            .get_or_refresh(env, || async move { issue_token(&http, env).await })
            .await
            .map_err(|e| CoreError::Fatal(format!("token issuance failed: {e}")))
    }

    async fn headers(&self, tr_id: &str) -> CoreResult<reqwest::header::HeaderMap> {
        let token = self.access_token().await?;
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("content-type", "application/json; charset=utf-8".parse().unwrap());
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers.insert("appkey", self.env.app_key.parse().unwrap());
        headers.insert("appsecret", self.env.app_secret.parse().unwrap());
        headers.insert("tr_id", tr_id.parse().unwrap());
        headers.insert("custtype", "P".parse().unwrap());
        Ok(headers)
    }

    async fn acquire_rate_slot(&self) -> CoreResult<()> {
        if self.rate_limiter.acquire(self.rate_limit_timeout).await {
            Ok(())
        } else {
            Err(CoreError::Fatal("rate limiter acquire timed out".into()))
        }
    }

    fn account_no_8(&self) -> String {
        self.env.account_no.chars().take(8).collect()
    }

    /// Dispatch one signed request with the original's retry-on-429/5xx
    /// policy (3 attempts, `0.4 * 2^n` second backoff).
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> CoreResult<serde_json::Value> {
        let mut attempt = 0;
        loop {
            self.acquire_rate_slot().await?;
            let resp = build().send().await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    let body: serde_json::Value = r
                        .json()
                        .await
                        .map_err(|e| CoreError::TransientBroker(format!("bad JSON body: {e}")))?;
                    return Ok(body);
                }
                Ok(r) if matches!(r.status(), StatusCode::TOO_MANY_REQUESTS) || r.status().is_server_error() => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(CoreError::TransientBroker(format!(
                            "exhausted retries, last status {}",
                            r.status()
                        )));
                    }
                    let delay = self.backoff_factor * 2f64.powi(attempt as i32 - 1);
                    warn!(attempt, delay, "retrying KIS request");
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Ok(r) => {
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    return Err(CoreError::BrokerLogical(format!("{status}: {body}")));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(CoreError::TransientBroker(format!("network error: {e}")));
                    }
                    let delay = self.backoff_factor * 2f64.powi(attempt as i32 - 1);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Err(e) => return Err(CoreError::TransientBroker(format!("request failed: {e}"))),
            }
        }
    }
}

#[async_trait]
impl super::BrokerClient for KisClient {
    #[instrument(skip(self), name = "kis::buy_ioc")]
    async fn buy_ioc(&self, code: &str, qty: u64, price: f64) -> CoreResult<String> {
        let headers = self.headers(tr_ids(self.env.mode).buy).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/order-cash", self.env.base_url);
        let body = json!({
            "CANO": self.account_no_8(),
            "ACNT_PRDT_CD": self.env.product_code,
            "PDNO": code,
            "ORD_DVSN": "01",
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": (price as i64).to_string(),
        });
        let data = self
            .send_with_retry(|| self.http.post(&url).headers(headers.clone()).json(&body))
            .await?;
        parse_order_response(&data)
    }

    #[instrument(skip(self), name = "kis::buy_market")]
    async fn buy_market(&self, code: &str, qty: u64) -> CoreResult<String> {
        let headers = self.headers(tr_ids(self.env.mode).buy).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/order-cash", self.env.base_url);
        let body = json!({
            "CANO": self.account_no_8(),
            "ACNT_PRDT_CD": self.env.product_code,
            "PDNO": code,
            "ORD_DVSN": "01",
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": "0",
        });
        let data = self
            .send_with_retry(|| self.http.post(&url).headers(headers.clone()).json(&body))
            .await?;
        parse_order_response(&data)
    }

    #[instrument(skip(self), name = "kis::sell_market")]
    async fn sell_market(&self, code: &str, qty: u64) -> CoreResult<String> {
        let headers = self.headers(tr_ids(self.env.mode).sell).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/order-cash", self.env.base_url);
        let body = json!({
            "CANO": self.account_no_8(),
            "ACNT_PRDT_CD": self.env.product_code,
            "PDNO": code,
            "ORD_DVSN": "01",
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": "0",
        });
        let data = self
            .send_with_retry(|| self.http.post(&url).headers(headers.clone()).json(&body))
            .await?;
        parse_order_response(&data)
    }

    #[instrument(skip(self), name = "kis::sell_ioc")]
    async fn sell_ioc(&self, code: &str, qty: u64, price: f64) -> CoreResult<String> {
        let headers = self.headers(tr_ids(self.env.mode).sell).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/order-cash", self.env.base_url);
        let body = json!({
            "CANO": self.account_no_8(),
            "ACNT_PRDT_CD": self.env.product_code,
            "PDNO": code,
            "ORD_DVSN": "01",
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": (price as i64).to_string(),
        });
        let data = self
            .send_with_retry(|| self.http.post(&url).headers(headers.clone()).json(&body))
            .await?;
        parse_order_response(&data)
    }

    #[instrument(skip(self), name = "kis::cancel_order")]
    async fn cancel_order(&self, order_no: &str, code: &str, qty: u64, price: f64) -> CoreResult<()> {
        let headers = self.headers(tr_ids(self.env.mode).cancel).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/order-rvsecncl", self.env.base_url);
        let body = json!({
            "CANO": self.account_no_8(),
            "ACNT_PRDT_CD": self.env.product_code,
            "KRX_FWDG_ORD_ORGNO": "",
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "01",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": (price as i64).to_string(),
            "QTY_ALL_ORD_YN": "Y",
            "PDNO": code,
        });
        self.send_with_retry(|| self.http.post(&url).headers(headers.clone()).json(&body))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "kis::get_balance")]
    async fn get_balance(&self) -> CoreResult<BalanceSnapshot> {
        let headers = self.headers(tr_ids(self.env.mode).balance).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/inquire-balance", self.env.base_url);
        let params = balance_query_params(&self.account_no_8(), &self.env.product_code);
        let data = self
            .send_with_retry(|| self.http.get(&url).headers(headers.clone()).query(&params))
            .await?;
        parse_balance_response(&data)
    }

    #[instrument(skip(self), name = "kis::get_order_status")]
    async fn get_order_status(&self, order_no: &str) -> CoreResult<OrderStatusSnapshot> {
        let headers = self.headers(tr_ids(self.env.mode).orders).await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/inquire-daily-ccld", self.env.base_url);
        let today = chrono::Utc::now().format("%Y%m%d").to_string();
        let params = [
            ("CANO", self.account_no_8()),
            ("ACNT_PRDT_CD", self.env.product_code.clone()),
            ("INQR_STRT_DT", today.clone()),
            ("INQR_END_DT", today),
            ("ODNO", order_no.to_string()),
            ("CCLD_DVSN", "00".to_string()),
        ];
        let data = self
            .send_with_retry(|| self.http.get(&url).headers(headers.clone()).query(&params))
            .await?;
        parse_order_status_response(&data, order_no)
    }

    #[instrument(skip(self), name = "kis::inquire_minute_bars")]
    async fn inquire_minute_bars(&self, code: &str, count: u32) -> CoreResult<Vec<Bar>> {
        let headers = self.headers("FHKST03010200").await?;
        let url = format!(
            "{}/uapi/domestic-stock/v1/quotations/inquire-time-itemchartprice",
            self.env.base_url
        );
        let params = [
            ("FID_ETC_CLS_CODE", ""),
            ("FID_COND_MRKT_DIV_CODE", "J"),
            ("FID_INPUT_ISCD", code),
            ("FID_INPUT_HOUR_1", "153000"),
            ("FID_PW_DATA_INCU_YN", "Y"),
        ];
        let data = self
            .send_with_retry(|| self.http.get(&url).headers(headers.clone()).query(&params))
            .await?;
        parse_bars_response(&data, count)
    }

    #[instrument(skip(self), name = "kis::pre_warm")]
    async fn pre_warm(&self) -> CoreResult<()> {
        debug!(mode = %self.env.mode, "pre-warming KIS connection");
        self.get_balance().await.map(|_| ())
    }
}

fn limit_from_ask1(ask1: f64, n_ticks: u32) -> f64 {
    limit_price(ask1, n_ticks)
}

fn balance_query_params(cano: &str, prdt: &str) -> Vec<(&'static str, String)> {
    vec![
        ("CANO", cano.to_string()),
        ("ACNT_PRDT_CD", prdt.to_string()),
        ("AFHR_FLPR_YN", "N".to_string()),
        ("OFL_YN", "N".to_string()),
        ("INQR_DVSN", "02".to_string()),
        ("UNPR_DVSN", "01".to_string()),
        ("FUND_STTL_ICLD_YN", "N".to_string()),
        ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
        ("PRCS_DVSN", "01".to_string()),
        ("CTX_AREA_FK100", "".to_string()),
        ("CTX_AREA_NK100", "".to_string()),
    ]
}

fn parse_order_response(data: &serde_json::Value) -> CoreResult<String> {
    let rt_cd = data.get("rt_cd").and_then(|v| v.as_str()).unwrap_or("9");
    if rt_cd != "0" {
        let msg = data.get("msg1").and_then(|v| v.as_str()).unwrap_or("rejected");
        return Err(CoreError::BrokerLogical(msg.to_string()));
    }
    data.get("output")
        .and_then(|o| o.get("ODNO"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| CoreError::TransientBroker("order response missing ODNO".into()))
}

fn parse_balance_response(data: &serde_json::Value) -> CoreResult<BalanceSnapshot> {
    let holdings = data
        .get("output1")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut positions = Vec::with_capacity(holdings.len());
    for h in &holdings {
        let code = h.get("pdno").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let quantity = parse_numeric_field(h, "hldg_qty");
        let avg_price = parse_numeric_field(h, "pchs_avg_pric");
        if quantity > 0.0 {
            positions.push(BrokerPosition { code, quantity, avg_price });
        }
    }

    let summary = data
        .get("output2")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let cash_krw = parse_numeric_field(&summary, "dnca_tot_amt");
    let total_evaluation_krw = parse_numeric_field(&summary, "tot_evlu_amt");

    Ok(BalanceSnapshot { cash_krw, positions, total_evaluation_krw })
}

fn parse_numeric_field(v: &serde_json::Value, key: &str) -> f64 {
    v.get(key)
        .and_then(|x| x.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn parse_order_status_response(data: &serde_json::Value, order_no: &str) -> CoreResult<OrderStatusSnapshot> {
    let rows = data.get("output1").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let row = rows
        .iter()
        .find(|r| r.get("odno").and_then(|v| v.as_str()) == Some(order_no))
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let filled_qty = parse_numeric_field(&row, "tot_ccld_qty");
    let order_qty = parse_numeric_field(&row, "ord_qty");
    let remaining_qty = (order_qty - filled_qty).max(0.0);
    let avg_fill_price = if filled_qty > 0.0 {
        Some(parse_numeric_field(&row, "avg_prvs"))
    } else {
        None
    };

    let status = if row.is_null() {
        OrderStatus::Unknown
    } else if filled_qty <= 0.0 {
        OrderStatus::Pending
    } else if remaining_qty > 0.0 {
        OrderStatus::Partial
    } else {
        OrderStatus::Filled
    };

    Ok(OrderStatusSnapshot { filled_qty, remaining_qty, status, avg_fill_price })
}

fn parse_bars_response(data: &serde_json::Value, count: u32) -> CoreResult<Vec<Bar>> {
    let rows = data
        .get("output2")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut bars: Vec<Bar> = rows
        .iter()
        .take(count as usize)
        .filter_map(|r| {
            let date = r.get("stck_bsop_date")?.as_str()?;
            let time = r.get("stck_cntg_hour")?.as_str()?;
            let epoch = chrono::NaiveDateTime::parse_from_str(
                &format!("{date}{time}"),
                "%Y%m%d%H%M%S",
            )
            .ok()?
            .and_utc()
            .timestamp();
            Some(Bar {
                open_time_epoch_s: epoch,
                open: parse_numeric_field(r, "stck_oprc"),
                high: parse_numeric_field(r, "stck_hgpr"),
                low: parse_numeric_field(r, "stck_lwpr"),
                close: parse_numeric_field(r, "stck_prpr"),
                volume: parse_numeric_field(r, "cntg_vol"),
            })
        })
        .collect();

    bars.reverse();
    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct TokenIssueResponse {
    access_token: String,
    expires_in: i64,
}

async fn issue_token(
    http: &reqwest::Client,
    env: &BrokerEnv,
) -> anyhow::Result<(String, chrono::DateTime<chrono::Utc>)> {
    let url = format!("{}/oauth2/tokenP", env.base_url);
    let body = json!({
        "grant_type": "client_credentials",
        "appkey": env.app_key,
        "appsecret": env.app_secret,
    });
    let resp = http.post(&url).json(&body).send().await?;
    let resp = resp.error_for_status()?;
    let parsed: TokenIssueResponse = resp.json().await?;
    let expires_at = chrono::Utc::now() + chrono::Duration::seconds(parsed.expires_in);
    Ok((parsed.access_token, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tr_ids_switch_with_mode() {
        assert_eq!(tr_ids(AccountMode::Paper).buy, "VTTC0802U");
        assert_eq!(tr_ids(AccountMode::Live).buy, "TTTC0802U");
    }

    #[test]
    fn parse_order_response_extracts_order_no() {
        let data = json!({"rt_cd": "0", "output": {"ODNO": "123456"}});
        assert_eq!(parse_order_response(&data).unwrap(), "123456");
    }

    #[test]
    fn parse_order_response_rejects_nonzero_rt_cd() {
        let data = json!({"rt_cd": "1", "msg1": "insufficient balance"});
        let err = parse_order_response(&data).unwrap_err();
        assert!(matches!(err, CoreError::BrokerLogical(_)));
    }

    #[test]
    fn parse_balance_response_filters_zero_quantity_holdings() {
        let data = json!({
            "output1": [
                {"pdno": "005930", "hldg_qty": "10", "pchs_avg_pric": "70000"},
                {"pdno": "000660", "hldg_qty": "0", "pchs_avg_pric": "0"},
            ],
            "output2": [{"dnca_tot_amt": "1000000", "tot_evlu_amt": "1700000"}],
        });
        let snapshot = parse_balance_response(&data).unwrap();
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].code, "005930");
        assert!((snapshot.cash_krw - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn limit_from_ask1_matches_tick_table() {
        assert!((limit_from_ask1(72_000.0, 3) - 72_300.0).abs() < 1e-9);
    }
}
