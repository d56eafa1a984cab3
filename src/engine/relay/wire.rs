// relay/wire.rs — DTOs for the cloud relay HTTP surface
//
// Everything on this wire is snake_case JSON. These structs are the single
// serialization profile for the relay boundary; core types never derive
// relay-specific quirks.

use crate::atoms::types::{BonusToken, BoundingBox, MonthlyUsage, TranslatedItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── POST /api/translate ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TranslateRequestWire<'a> {
    pub provider: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<&'a str>,
    /// Pre-extracted text, for callers that already ran OCR upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<&'a str>,
    pub source_language: &'a str,
    pub target_language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'a str>,
    pub request_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TranslateResponseWire {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub request_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub detected_text: Option<String>,
    #[serde(default)]
    pub translated_text: Option<String>,
    #[serde(default)]
    pub detected_language: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsageWire>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub texts: Option<Vec<TextItemWire>>,
    #[serde(default)]
    pub monthly_usage: Option<MonthlyUsageWire>,
    #[serde(default)]
    pub error: Option<ErrorWire>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorWire {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenUsageWire {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub image_tokens: u64,
    /// Server-computed sum; recomputed locally, kept for wire fidelity.
    #[serde(default)]
    #[allow(dead_code)]
    pub total_tokens: u64,
}

impl TokenUsageWire {
    pub fn into_usage(self) -> crate::atoms::types::TokenUsage {
        crate::atoms::types::TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            image_tokens: self.image_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TextItemWire {
    pub text: String,
    #[serde(default)]
    pub bounding_box: Option<BoundingBoxWire>,
}

#[derive(Debug, Deserialize)]
pub struct BoundingBoxWire {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl TextItemWire {
    pub fn into_item(self) -> TranslatedItem {
        TranslatedItem {
            text: self.text,
            bounding_box: self.bounding_box.map(|b| BoundingBox {
                x: b.x,
                y: b.y,
                width: b.width,
                height: b.height,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonthlyUsageWire {
    pub year_month: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub tokens_limit: u64,
    /// Server-derived; the local model derives its own.
    #[serde(default)]
    #[allow(dead_code)]
    pub is_exceeded: Option<bool>,
}

impl MonthlyUsageWire {
    pub fn into_usage(self) -> MonthlyUsage {
        MonthlyUsage::new(self.year_month, self.tokens_used, self.tokens_limit)
    }
}

// ── GET /api/quota/status ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QuotaStatusWire {
    #[serde(default)]
    pub success: bool,
    pub monthly_usage: MonthlyUsageWire,
    #[serde(default)]
    #[allow(dead_code)]
    pub plan: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub has_bonus_tokens: Option<bool>,
}

// ── GET /api/sync/init ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SyncInitWire {
    #[serde(default)]
    pub promotion: Option<PromotionWire>,
    #[serde(default)]
    pub consent: Option<serde_json::Value>,
    #[serde(default)]
    pub bonus_tokens: Option<Vec<BonusTokenWire>>,
    #[serde(default)]
    pub quota: Option<MonthlyUsageWire>,
    #[serde(default)]
    pub partial_failure: bool,
    #[serde(default)]
    pub failed_components: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromotionWire {
    pub code: String,
    pub plan_type: String,
    pub applied_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BonusTokenWire {
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub granted_tokens: u64,
    #[serde(default)]
    pub used_tokens: u64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BonusTokenWire {
    pub fn into_bonus(self) -> BonusToken {
        BonusToken {
            id: self.id,
            source: self.source,
            granted_tokens: self.granted_tokens,
            used_tokens: self.used_tokens,
            expires_at: self.expires_at,
        }
    }
}

// ── POST /api/promotion/redeem ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RedeemRequestWire<'a> {
    pub code: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RedeemResponseWire {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ── /api/bonus-tokens ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BonusStatusWire {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub bonus_tokens: Vec<BonusTokenWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusSyncEntryWire {
    pub id: String,
    pub used_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct BonusSyncRequestWire {
    pub tokens: Vec<BonusSyncEntryWire>,
}

#[derive(Debug, Deserialize)]
pub struct BonusSyncResponseWire {
    #[serde(default)]
    pub success: bool,
    /// Server echo of the accepted counts.
    #[serde(default)]
    pub tokens: Vec<BonusSyncEntryWire>,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_response_parses_quota_exceeded_body() {
        // 403 with an error code and a usage snapshot attached.
        let raw = r#"{
            "success": false,
            "error": {"code": "QUOTA_EXCEEDED", "message": "monthly cap reached"},
            "monthly_usage": {"year_month": "2025-01", "tokens_used": 120000, "tokens_limit": 100000, "is_exceeded": true}
        }"#;
        let parsed: TranslateResponseWire = serde_json::from_str(raw).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_ref().unwrap().code.as_deref(), Some("QUOTA_EXCEEDED"));
        let usage = parsed.monthly_usage.unwrap().into_usage();
        assert_eq!(usage.tokens_used, 120_000);
        assert!(usage.is_exceeded());
    }

    #[test]
    fn test_translate_request_omits_absent_fields() {
        let wire = TranslateRequestWire {
            provider: "gemini",
            image_base64: None,
            mime_type: None,
            text: Some("こんにちは"),
            source_language: "ja",
            target_language: "en",
            context: None,
            request_id: "r1",
        };
        let value = serde_json::to_value(&wire).unwrap();
        assert!(value.get("image_base64").is_none());
        assert_eq!(value["text"], "こんにちは");
        assert_eq!(value["source_language"], "ja");
    }

    #[test]
    fn test_sync_init_tolerates_partial_payload() {
        let raw = r#"{"partial_failure": true, "failed_components": ["promotion"], "quota": {"year_month": "2025-02"}}"#;
        let parsed: SyncInitWire = serde_json::from_str(raw).unwrap();
        assert!(parsed.partial_failure);
        assert_eq!(parsed.failed_components, vec!["promotion"]);
        assert!(parsed.promotion.is_none());
        assert_eq!(parsed.quota.unwrap().year_month, "2025-02");
    }
}
