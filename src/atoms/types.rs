// ── Honyaku Atoms: Pure Data Types ─────────────────────────────────────────
// The data structures that flow through the entire translation core.
// They are independent of any specific backend; wire-level DTOs live next to
// the boundary that speaks them (engine/relay/wire.rs, engine/nllb_engine).
//
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use crate::atoms::constants::MONTH_KEY_FORMAT;
use crate::atoms::error::CoreError;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Translation request / response ─────────────────────────────────────────

/// One unit of work for the router: a source string and where it should go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub request_id: String,
    pub text: String,
    /// ISO language code of the source text ("ja", "en", …).
    pub source_language: String,
    pub target_language: String,
    /// Optional surrounding text (previous lines, speaker name) the cloud
    /// relay may use for disambiguation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Bearer token for cloud-backed requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Screenshot region for the relay's image endpoint. Local backends
    /// translate `text` and ignore these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl TranslationRequest {
    pub fn new(
        text: impl Into<String>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        TranslationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            source_language: source_language.into(),
            target_language: target_language.into(),
            context: None,
            session_token: None,
            image_base64: None,
            mime_type: None,
        }
    }

    /// "ja-en" style key used for batching and the port registry.
    pub fn language_pair(&self) -> String {
        format!("{}-{}", self.source_language, self.target_language)
    }
}

/// One translated region when a request carries multiple text blocks
/// (the relay may return several items per screenshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedItem {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// The unified result every backend produces.
///
/// Invariant: exactly one of `translated_text` / `error` is set. Use the
/// `ok` / `fail` constructors; never build one field-by-field in new code.
#[derive(Debug, Clone)]
pub struct TranslationResponse {
    pub request_id: String,
    pub success: bool,
    pub detected_language: Option<String>,
    pub translated_text: Option<String>,
    /// Multi-item results (relay image endpoint); empty otherwise.
    pub items: Vec<TranslatedItem>,
    pub provider_id: String,
    pub confidence: Option<f32>,
    pub token_usage: TokenUsage,
    pub processing_time: Duration,
    pub error: Option<CoreError>,
    /// Server-authoritative usage snapshot when the relay attached one.
    pub monthly_usage: Option<MonthlyUsage>,
}

impl TranslationResponse {
    pub fn ok(
        request_id: impl Into<String>,
        provider_id: impl Into<String>,
        translated_text: impl Into<String>,
    ) -> Self {
        TranslationResponse {
            request_id: request_id.into(),
            success: true,
            detected_language: None,
            translated_text: Some(translated_text.into()),
            items: Vec::new(),
            provider_id: provider_id.into(),
            confidence: None,
            token_usage: TokenUsage::default(),
            processing_time: Duration::ZERO,
            error: None,
            monthly_usage: None,
        }
    }

    pub fn fail(
        request_id: impl Into<String>,
        provider_id: impl Into<String>,
        error: CoreError,
    ) -> Self {
        TranslationResponse {
            request_id: request_id.into(),
            success: false,
            detected_language: None,
            translated_text: None,
            items: Vec::new(),
            provider_id: provider_id.into(),
            confidence: None,
            token_usage: TokenUsage::default(),
            processing_time: Duration::ZERO,
            error: Some(error),
            monthly_usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = usage;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.processing_time = elapsed;
        self
    }
}

// ── Token usage ────────────────────────────────────────────────────────────

/// Token counts reported by a backend (for metering).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub image_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        TokenUsage { input_tokens, output_tokens, image_tokens: 0 }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.image_tokens
    }
}

// ── Monthly usage ──────────────────────────────────────────────────────────

/// One month's quota bucket. `year_month` is "YYYY-MM" in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyUsage {
    pub year_month: String,
    pub tokens_used: u64,
    pub tokens_limit: u64,
}

impl MonthlyUsage {
    pub fn new(year_month: impl Into<String>, tokens_used: u64, tokens_limit: u64) -> Self {
        MonthlyUsage { year_month: year_month.into(), tokens_used, tokens_limit }
    }

    /// Fresh zeroed bucket for the month containing `now`.
    pub fn for_month(now: DateTime<Utc>, tokens_limit: u64) -> Self {
        MonthlyUsage {
            year_month: now.format(MONTH_KEY_FORMAT).to_string(),
            tokens_used: 0,
            tokens_limit,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.tokens_used >= self.tokens_limit
    }
}

// ── Bonus tokens ───────────────────────────────────────────────────────────

/// A grant of allowance tokens outside the monthly quota.
/// Invariant: `0 ≤ used_tokens ≤ granted_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BonusToken {
    pub id: String,
    /// Where the grant came from, e.g. "promotion".
    pub source: String,
    pub granted_tokens: u64,
    pub used_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BonusToken {
    pub fn remaining(&self) -> u64 {
        self.granted_tokens.saturating_sub(self.used_tokens)
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.remaining() > 0 && self.expires_at.map_or(true, |exp| now < exp)
    }
}

// ── License / plan ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Standard,
    Pro,
    Premium,
}

impl PlanType {
    /// Cloud translation requires a paying plan.
    pub fn allows_cloud(&self) -> bool {
        *self != PlanType::Free
    }

    pub fn parse(s: &str) -> Option<PlanType> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Some(PlanType::Free),
            "standard" => Some(PlanType::Standard),
            "pro" => Some(PlanType::Pro),
            "premium" => Some(PlanType::Premium),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Standard => "standard",
            PlanType::Pro => "pro",
            PlanType::Premium => "premium",
        }
    }
}

/// State of an applied promotion code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionState {
    pub code: String,
    pub plan: PlanType,
    pub applied_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PromotionState {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// The full licensing snapshot the quota gate guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseState {
    pub plan: PlanType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub monthly_usage: MonthlyUsage,
    pub bonus_tokens: Vec<BonusToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_server_sync: Option<DateTime<Utc>>,
}

impl LicenseState {
    /// Fresh state on the given plan with an empty current-month bucket.
    pub fn new(plan: PlanType, tokens_limit: u64, now: DateTime<Utc>) -> Self {
        LicenseState {
            plan,
            plan_expires_at: None,
            monthly_usage: MonthlyUsage::for_month(now, tokens_limit),
            bonus_tokens: Vec::new(),
            promotion: None,
            last_server_sync: None,
        }
    }
}

// ── Backend routing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// On-device ONNX OPUS-MT engine.
    #[serde(alias = "Local")]
    Local,
    /// Long-lived NLLB-200 inference server over local TCP.
    #[serde(alias = "Subprocess")]
    Subprocess,
    /// Remote HTTP relay.
    #[serde(alias = "Cloud")]
    Cloud,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Subprocess => "subprocess",
            BackendKind::Cloud => "cloud",
        }
    }
}

/// One attempt slot in a route: which backend, how often, how long.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteHop {
    pub backend: BackendKind,
    pub attempts: u32,
    pub timeout: Duration,
}

/// Ordered preference list the router walks for each request.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRoute {
    pub hops: Vec<RouteHop>,
}

impl BackendRoute {
    /// Preferred backend first, remaining kinds as fallbacks, each with a
    /// single attempt and the given timeout.
    pub fn with_preferred(preferred: BackendKind, timeout: Duration) -> Self {
        let mut order = vec![preferred];
        for kind in [BackendKind::Local, BackendKind::Subprocess, BackendKind::Cloud] {
            if kind != preferred {
                order.push(kind);
            }
        }
        BackendRoute {
            hops: order
                .into_iter()
                .map(|backend| RouteHop { backend, attempts: 1, timeout })
                .collect(),
        }
    }
}

// ── Compute device ─────────────────────────────────────────────────────────

/// Which execution provider the local engine should request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    #[serde(alias = "Cpu", alias = "CPU")]
    Cpu,
    #[serde(alias = "Cuda", alias = "GPU")]
    Cuda,
}

// ── Utility ────────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation. Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// "YYYY-MM" bucket key for `now`, always UTC.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format(MONTH_KEY_FORMAT).to_string()
}

/// `expires_at` policy for promotions: calendar month arithmetic, clamping
/// the day when the target month is shorter (Jan 31 + 1 month → Feb 28).
pub fn add_one_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if ts.month() == 12 { (ts.year() + 1, 1) } else { (ts.year(), ts.month() + 1) };
    let mut day = ts.day();
    loop {
        if let Some(candidate) = ts
            .with_day(1)
            .and_then(|d| d.with_year(year))
            .and_then(|d| d.with_month(month))
            .and_then(|d| d.with_day(day))
        {
            return candidate;
        }
        day -= 1;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage { input_tokens: 10, output_tokens: 25, image_tokens: 100 };
        assert_eq!(usage.total_tokens(), 135);
    }

    #[test]
    fn test_monthly_usage_exceeded_flag() {
        let mut usage = MonthlyUsage::new("2025-01", 99_999, 100_000);
        assert!(!usage.is_exceeded());
        usage.tokens_used = 100_000;
        assert!(usage.is_exceeded());
    }

    #[test]
    fn test_bonus_remaining_clamps_at_zero() {
        let bonus = BonusToken {
            id: "b1".into(),
            source: "promotion".into(),
            granted_tokens: 500,
            used_tokens: 500,
            expires_at: None,
        };
        assert_eq!(bonus.remaining(), 0);
        assert!(!bonus.is_usable(Utc::now()));
    }

    #[test]
    fn test_bonus_expired_is_unusable() {
        let past = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let bonus = BonusToken {
            id: "b1".into(),
            source: "promotion".into(),
            granted_tokens: 500,
            used_tokens: 0,
            expires_at: Some(past),
        };
        assert!(!bonus.is_usable(Utc::now()));
    }

    #[test]
    fn test_response_constructors_keep_xor_invariant() {
        let ok = TranslationResponse::ok("r1", "local_opusmt", "Hello");
        assert!(ok.success && ok.translated_text.is_some() && ok.error.is_none());

        let fail = TranslationResponse::fail("r1", "cloud", CoreError::QuotaExceeded);
        assert!(!fail.success && fail.translated_text.is_none() && fail.error.is_some());
    }

    #[test]
    fn test_plan_ordering_and_cloud_gate() {
        assert!(PlanType::Pro >= PlanType::Standard);
        assert!(PlanType::Premium > PlanType::Pro);
        assert!(!PlanType::Free.allows_cloud());
        assert!(PlanType::Standard.allows_cloud());
    }

    #[test]
    fn test_route_with_preferred_orders_fallbacks() {
        let route = BackendRoute::with_preferred(BackendKind::Subprocess, Duration::from_secs(15));
        let order: Vec<_> = route.hops.iter().map(|h| h.backend).collect();
        assert_eq!(
            order,
            vec![BackendKind::Subprocess, BackendKind::Local, BackendKind::Cloud]
        );
    }

    #[test]
    fn test_add_one_month_basic() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(add_one_month(t), Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_add_one_month_clamps_short_months() {
        let t = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(add_one_month(t), Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_add_one_month_december_rolls_year() {
        let t = Utc.with_ymd_and_hms(2025, 12, 15, 0, 0, 0).unwrap();
        assert_eq!(add_one_month(t), Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundaries() {
        let s = "日本語テキスト";
        let cut = truncate_utf8(s, 7);
        assert!(cut.len() <= 7);
        assert!(s.starts_with(cut));
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn test_language_pair_key() {
        let req = TranslationRequest::new("こんにちは", "ja", "en");
        assert_eq!(req.language_pair(), "ja-en");
        assert!(!req.request_id.is_empty());
    }
}
