// relay/client.rs — Cloud relay HTTP client
//
// Stateless bearer-authenticated JSON client: translation, quota/usage
// synchronization, coalesced startup init, promotion redeem, and the bonus
// ledger endpoints. Retries transient failures with a fixed backoff;
// metadata reads are deduplicated through the call coalescer.

use crate::atoms::constants::{COALESCE_TTL_SECS, RELAY_MAX_BODY_BYTES};
use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{
    truncate_utf8, BonusToken, MonthlyUsage, PlanType, PromotionState, TokenUsage,
    TranslationRequest, TranslationResponse,
};
use crate::engine::config::CloudConfig;
use crate::engine::relay::coalesce::CallCoalescer;
use crate::engine::relay::wire::*;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{error, info, warn};
use reqwest::Method;
use std::time::{Duration, Instant};

pub const RELAY_PROVIDER_ID: &str = "cloud_relay";

/// Everything `sync_init` coalesces into one call.
#[derive(Debug, Clone)]
pub struct SyncInitState {
    pub promotion: Option<PromotionState>,
    pub consent: Option<serde_json::Value>,
    pub bonus_tokens: Vec<BonusToken>,
    pub quota: Option<MonthlyUsage>,
    pub partial_failure: bool,
    pub failed_components: Vec<String>,
}

// ── Transport ──────────────────────────────────────────────────────────────

/// The retrying HTTP layer, cheap to clone into coalesced closures.
#[derive(Clone)]
struct RelayTransport {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl RelayTransport {
    /// Send one request, retrying network errors, timeouts, 429 and 5xx up
    /// to `max_retries` with the fixed backoff. Terminal statuses (2xx,
    /// 401, 403, other 4xx) come back as `(status, body)` after the safety
    /// validation; 401 short-circuits to `SessionInvalid`.
    async fn send_json(
        &self,
        method: Method,
        path: &str,
        session_token: &str,
        body: Option<serde_json::Value>,
    ) -> CoreResult<(u16, serde_json::Value)> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = CoreError::internal("relay request never attempted");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(
                    "[relay] retry {}/{} for {} after {}ms",
                    attempt,
                    self.max_retries,
                    path,
                    self.retry_delay.as_millis()
                );
                tokio::time::sleep(self.retry_delay).await;
            }

            let mut builder = self.http.request(method.clone(), &url).bearer_auth(session_token);
            if let Some(payload) = &body {
                builder = builder.json(payload);
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.into();
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status == 429 || status >= 500 {
                let text = response.text().await.unwrap_or_default();
                error!("[relay] {} returned {}: {}", path, status, truncate_utf8(&text, 200));
                last_error = if status == 429 {
                    CoreError::RateLimited
                } else {
                    CoreError::Api { status, message: truncate_utf8(&text, 200).to_string() }
                };
                continue;
            }
            if status == 401 {
                return Err(CoreError::SessionInvalid);
            }

            // Safety validation: media type and body size, before parsing.
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !content_type.starts_with("application/json")
                && !content_type.starts_with("application/problem+json")
            {
                return Err(CoreError::protocol(format!(
                    "unexpected content type `{}`",
                    content_type
                )));
            }
            if let Some(length) = response.content_length() {
                if length as usize > RELAY_MAX_BODY_BYTES {
                    return Err(CoreError::protocol("response body too large"));
                }
            }

            let bytes = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    last_error = e.into();
                    continue;
                }
            };
            if bytes.len() > RELAY_MAX_BODY_BYTES {
                return Err(CoreError::protocol("response body too large"));
            }
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::protocol(format!("malformed relay body: {}", e)))?;
            return Ok((status, value));
        }

        Err(last_error)
    }
}

// ── Client ─────────────────────────────────────────────────────────────────

pub struct RelayClient {
    transport: RelayTransport,
    quota_calls: CallCoalescer<MonthlyUsage>,
    init_calls: CallCoalescer<SyncInitState>,
    bonus_calls: CallCoalescer<Vec<BonusToken>>,
}

impl RelayClient {
    pub fn new(config: &CloudConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CoreError::config(format!("relay http client: {}", e)))?;

        let ttl = Duration::from_secs(COALESCE_TTL_SECS);
        Ok(RelayClient {
            transport: RelayTransport {
                http,
                base_url: config.relay_server_url.trim_end_matches('/').to_string(),
                max_retries: config.max_retries,
                retry_delay: config.retry_delay(),
            },
            quota_calls: CallCoalescer::new(ttl),
            init_calls: CallCoalescer::new(ttl),
            bonus_calls: CallCoalescer::new(ttl),
        })
    }

    // ── Translate ──────────────────────────────────────────────────────────

    /// POST /api/translate. Quota and session failures come back as
    /// structured errors on the response; a server usage snapshot rides
    /// along either way.
    pub async fn translate(
        &self,
        request: &TranslationRequest,
        session_token: &str,
        provider_id: &str,
    ) -> TranslationResponse {
        let started = Instant::now();
        info!("[relay] translate via provider {}", provider_id);

        let wire = TranslateRequestWire {
            provider: provider_id,
            image_base64: request.image_base64.as_deref(),
            mime_type: request.mime_type.as_deref(),
            text: (!request.text.is_empty()).then_some(request.text.as_str()),
            source_language: &request.source_language,
            target_language: &request.target_language,
            context: request.context.as_deref(),
            request_id: &request.request_id,
        };
        let body = match serde_json::to_value(&wire) {
            Ok(b) => b,
            Err(e) => {
                return TranslationResponse::fail(
                    &request.request_id,
                    provider_id,
                    CoreError::internal(format!("serialize translate request: {}", e)),
                );
            }
        };

        let sent = self
            .transport
            .send_json(Method::POST, "/api/translate", session_token, Some(body))
            .await;

        let response = match sent {
            Err(e) => TranslationResponse::fail(&request.request_id, provider_id, e),
            Ok((status, value)) => match serde_json::from_value::<TranslateResponseWire>(value) {
                Err(e) => TranslationResponse::fail(
                    &request.request_id,
                    provider_id,
                    CoreError::protocol(format!("translate response: {}", e)),
                ),
                Ok(parsed) => interpret_translate(parsed, status, request, provider_id),
            },
        };
        response.with_elapsed(started.elapsed())
    }

    // ── Quota ──────────────────────────────────────────────────────────────

    /// GET /api/quota/status — server-authoritative view, deduplicated.
    pub async fn get_quota_status(&self, session_token: &str) -> CoreResult<MonthlyUsage> {
        let transport = self.transport.clone();
        let token = session_token.to_string();
        self.quota_calls
            .run("quota_status", move || {
                async move {
                    let (status, value) = transport
                        .send_json(Method::GET, "/api/quota/status", &token, None)
                        .await?;
                    expect_ok(status)?;
                    let parsed: QuotaStatusWire = serde_json::from_value(value)
                        .map_err(|e| CoreError::protocol(format!("quota status: {}", e)))?;
                    Ok(parsed.monthly_usage.into_usage())
                }
                .boxed()
            })
            .await
    }

    // ── Startup sync ───────────────────────────────────────────────────────

    /// GET /api/sync/init — promotion/consent/bonus/quota in one coalesced
    /// call.
    pub async fn sync_init(&self, session_token: &str) -> CoreResult<SyncInitState> {
        let transport = self.transport.clone();
        let token = session_token.to_string();
        self.init_calls
            .run("sync_init", move || {
                async move {
                    let (status, value) = transport
                        .send_json(Method::GET, "/api/sync/init", &token, None)
                        .await?;
                    expect_ok(status)?;
                    let parsed: SyncInitWire = serde_json::from_value(value)
                        .map_err(|e| CoreError::protocol(format!("sync init: {}", e)))?;
                    if parsed.partial_failure {
                        warn!(
                            "[relay] sync init partial failure: {:?}",
                            parsed.failed_components
                        );
                    }
                    Ok(SyncInitState {
                        promotion: parsed.promotion.map(promotion_from_wire),
                        consent: parsed.consent,
                        bonus_tokens: parsed
                            .bonus_tokens
                            .unwrap_or_default()
                            .into_iter()
                            .map(BonusTokenWire::into_bonus)
                            .collect(),
                        quota: parsed.quota.map(MonthlyUsageWire::into_usage),
                        partial_failure: parsed.partial_failure,
                        failed_components: parsed.failed_components,
                    })
                }
                .boxed()
            })
            .await
    }

    // ── Promotion ──────────────────────────────────────────────────────────

    /// POST /api/promotion/redeem.
    pub async fn redeem_promotion(
        &self,
        code: &str,
        session_token: &str,
    ) -> CoreResult<(PlanType, DateTime<Utc>)> {
        let body = serde_json::to_value(RedeemRequestWire { code })
            .map_err(|e| CoreError::internal(format!("serialize redeem request: {}", e)))?;
        let (status, value) = self
            .transport
            .send_json(Method::POST, "/api/promotion/redeem", session_token, Some(body))
            .await?;
        expect_ok(status)?;
        let parsed: RedeemResponseWire = serde_json::from_value(value)
            .map_err(|e| CoreError::protocol(format!("redeem response: {}", e)))?;

        if !parsed.success {
            let detail = parsed
                .message
                .or(parsed.error_code)
                .unwrap_or_else(|| "promotion redeem rejected".into());
            return Err(CoreError::Internal(detail));
        }
        let plan = parsed
            .plan_type
            .as_deref()
            .and_then(PlanType::parse)
            .unwrap_or(PlanType::Pro);
        let expires_at = parsed
            .expires_at
            .ok_or_else(|| CoreError::protocol("redeem response without expires_at"))?;
        Ok((plan, expires_at))
    }

    // ── Bonus ledger ───────────────────────────────────────────────────────

    /// GET /api/bonus-tokens/status — deduplicated read.
    pub async fn get_bonus_status(&self, session_token: &str) -> CoreResult<Vec<BonusToken>> {
        let transport = self.transport.clone();
        let token = session_token.to_string();
        self.bonus_calls
            .run("bonus_status", move || {
                async move {
                    let (status, value) = transport
                        .send_json(Method::GET, "/api/bonus-tokens/status", &token, None)
                        .await?;
                    expect_ok(status)?;
                    let parsed: BonusStatusWire = serde_json::from_value(value)
                        .map_err(|e| CoreError::protocol(format!("bonus status: {}", e)))?;
                    Ok(parsed
                        .bonus_tokens
                        .into_iter()
                        .map(BonusTokenWire::into_bonus)
                        .collect())
                }
                .boxed()
            })
            .await
    }

    /// POST /api/bonus-tokens/sync — never coalesced (it mutates). Returns
    /// the server's echoed used counts.
    pub async fn sync_bonus_tokens(
        &self,
        session_token: &str,
        entries: Vec<BonusSyncEntryWire>,
    ) -> CoreResult<Vec<BonusSyncEntryWire>> {
        let body = serde_json::to_value(BonusSyncRequestWire { tokens: entries })
            .map_err(|e| CoreError::internal(format!("serialize bonus sync: {}", e)))?;
        let (status, value) = self
            .transport
            .send_json(Method::POST, "/api/bonus-tokens/sync", session_token, Some(body))
            .await?;
        expect_ok(status)?;
        let parsed: BonusSyncResponseWire = serde_json::from_value(value)
            .map_err(|e| CoreError::protocol(format!("bonus sync response: {}", e)))?;
        if !parsed.success {
            return Err(CoreError::Api { status, message: "bonus sync rejected".into() });
        }
        // The cached ledger view is stale now.
        self.bonus_calls.invalidate("bonus_status");
        Ok(parsed.tokens)
    }
}

// ── Response interpretation ────────────────────────────────────────────────

fn interpret_translate(
    parsed: TranslateResponseWire,
    status: u16,
    request: &TranslationRequest,
    provider_id: &str,
) -> TranslationResponse {
    let monthly_usage = parsed.monthly_usage.clone().map(MonthlyUsageWire::into_usage);

    if !parsed.success || status >= 400 {
        let code = parsed.error.as_ref().and_then(|e| e.code.clone()).unwrap_or_default();
        let message = parsed
            .error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| "relay reported failure".into());
        let error = match code.as_str() {
            "QUOTA_EXCEEDED" => CoreError::QuotaExceeded,
            "SESSION_INVALID" => CoreError::SessionInvalid,
            "PLAN_NOT_SUPPORTED" => CoreError::PlanNotSupported(message),
            "RATE_LIMITED" => CoreError::RateLimited,
            _ if status == 403 => CoreError::PlanNotSupported(message),
            _ => CoreError::Api { status, message },
        };
        let mut response = TranslationResponse::fail(&request.request_id, provider_id, error);
        response.monthly_usage = monthly_usage;
        return response;
    }

    let items: Vec<_> = parsed
        .texts
        .unwrap_or_default()
        .into_iter()
        .map(TextItemWire::into_item)
        .collect();
    let translated_text = match parsed.translated_text {
        Some(text) => text,
        None if !items.is_empty() => items
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        None => {
            return TranslationResponse::fail(
                &request.request_id,
                provider_id,
                CoreError::protocol("success response without translated text"),
            );
        }
    };

    let mut response = TranslationResponse::ok(&request.request_id, provider_id, translated_text);
    response.items = items;
    response.detected_language = parsed.detected_language;
    response.provider_id = parsed.provider_id.unwrap_or_else(|| provider_id.to_string());
    response.token_usage = parsed
        .token_usage
        .map(TokenUsageWire::into_usage)
        .unwrap_or_else(TokenUsage::default);
    response.monthly_usage = monthly_usage;
    if let Some(ms) = parsed.processing_time_ms {
        response.processing_time = Duration::from_millis(ms);
    }
    response
}

fn promotion_from_wire(wire: PromotionWire) -> PromotionState {
    PromotionState {
        code: wire.code,
        plan: PlanType::parse(&wire.plan_type).unwrap_or(PlanType::Pro),
        applied_at: wire.applied_at,
        expires_at: wire.expires_at,
    }
}

/// Terminal non-2xx statuses on metadata endpoints (401 was short-circuited
/// by the transport).
fn expect_ok(status: u16) -> CoreResult<()> {
    match status {
        200..=299 => Ok(()),
        403 => Err(CoreError::PlanNotSupported("relay refused this endpoint".into())),
        _ => Err(CoreError::Internal(format!("relay returned {}", status))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server: serves the queued responses one connection
    /// at a time, closing each connection after its response.
    async fn spawn_http(responses: Vec<(u16, &'static str, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for (status, content_type, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                // Drain the request head (and any body) best-effort.
                let mut buffer = [0u8; 8192];
                let _ = stream.read(&mut buffer).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    content_type,
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        format!("http://127.0.0.1:{}", port)
    }

    fn config(base_url: String, max_retries: u32) -> CloudConfig {
        CloudConfig {
            enabled: true,
            relay_server_url: base_url,
            timeout_seconds: 5,
            max_retries,
            retry_delay_ms: 10,
            primary_provider_id: "gemini".into(),
            secondary_provider_id: None,
        }
    }

    #[tokio::test]
    async fn test_translate_success_maps_body() {
        let body = serde_json::json!({
            "success": true,
            "request_id": "r1",
            "translated_text": "Hello",
            "detected_language": "ja",
            "provider_id": "gemini",
            "token_usage": {"input_tokens": 10, "output_tokens": 5, "image_tokens": 100, "total_tokens": 115},
            "processing_time_ms": 42,
            "monthly_usage": {"year_month": "2025-03", "tokens_used": 500, "tokens_limit": 100000}
        })
        .to_string();
        let base = spawn_http(vec![(200, "application/json", body)]).await;
        let client = RelayClient::new(&config(base, 0)).unwrap();

        let request = TranslationRequest::new("こんにちは", "ja", "en");
        let response = client.translate(&request, "token", "gemini").await;
        assert!(response.success);
        assert_eq!(response.translated_text.as_deref(), Some("Hello"));
        assert_eq!(response.token_usage.total_tokens(), 115);
        assert_eq!(response.monthly_usage.as_ref().unwrap().tokens_used, 500);
        assert_eq!(response.processing_time, Duration::from_millis(42));
    }

    #[tokio::test]
    async fn test_translate_quota_exceeded_attaches_usage() {
        let body = serde_json::json!({
            "success": false,
            "error": {"code": "QUOTA_EXCEEDED", "message": "cap"},
            "monthly_usage": {"year_month": "2025-01", "tokens_used": 120000, "tokens_limit": 100000}
        })
        .to_string();
        let base = spawn_http(vec![(403, "application/json", body)]).await;
        let client = RelayClient::new(&config(base, 0)).unwrap();

        let request = TranslationRequest::new("text", "ja", "en");
        let response = client.translate(&request, "token", "gemini").await;
        assert!(!response.success);
        assert!(matches!(response.error, Some(CoreError::QuotaExceeded)));
        let usage = response.monthly_usage.unwrap();
        assert_eq!((usage.tokens_used, usage.tokens_limit), (120_000, 100_000));
        assert!(usage.is_exceeded());
    }

    #[tokio::test]
    async fn test_plain_403_maps_to_plan_not_supported() {
        let body = serde_json::json!({"success": false, "error": {"message": "upgrade required"}}).to_string();
        let base = spawn_http(vec![(403, "application/json", body)]).await;
        let client = RelayClient::new(&config(base, 0)).unwrap();

        let request = TranslationRequest::new("text", "ja", "en");
        let response = client.translate(&request, "token", "gemini").await;
        assert!(matches!(response.error, Some(CoreError::PlanNotSupported(_))));
    }

    #[tokio::test]
    async fn test_401_maps_to_session_invalid() {
        let base = spawn_http(vec![(401, "application/json", "{}".into())]).await;
        let client = RelayClient::new(&config(base, 0)).unwrap();
        let err = client.get_quota_status("stale").await.unwrap_err();
        assert_eq!(err, CoreError::SessionInvalid);
    }

    #[tokio::test]
    async fn test_retry_on_5xx_then_success() {
        let quota = serde_json::json!({
            "success": true,
            "monthly_usage": {"year_month": "2025-03", "tokens_used": 1, "tokens_limit": 10}
        })
        .to_string();
        let base = spawn_http(vec![
            (500, "application/json", "{}".into()),
            (200, "application/json", quota),
        ])
        .await;
        let client = RelayClient::new(&config(base, 2)).unwrap();

        let usage = client.get_quota_status("token").await.unwrap();
        assert_eq!(usage.tokens_used, 1);
    }

    #[tokio::test]
    async fn test_non_json_content_type_rejected() {
        let base = spawn_http(vec![(200, "text/html", "<html></html>".into())]).await;
        let client = RelayClient::new(&config(base, 0)).unwrap();
        let err = client.get_quota_status("token").await.unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_network_failure_is_retryable_error() {
        // Nothing listens on port 1.
        let client = RelayClient::new(&config("http://127.0.0.1:1".into(), 0)).unwrap();
        let request = TranslationRequest::new("text", "ja", "en");
        let response = client.translate(&request, "token", "gemini").await;
        let error = response.error.unwrap();
        assert!(error.is_retryable());
    }
}
