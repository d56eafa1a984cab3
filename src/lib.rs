// Honyaku — translation core of a real-time game-text pipeline.
//
// This crate is the engine only: screen capture, OCR, UI, and settings
// persistence live in the surrounding application. A caller assembles the
// backends it has (local model files, a managed NLLB server, relay
// credentials), hands them to the router, and gets unified responses with
// token-usage metadata back:
//
// ```no_run
// use std::sync::Arc;
// use honyaku::atoms::types::{LicenseState, PlanType, TranslationRequest};
// use honyaku::engine::{EngineConfig, EventBus, LicenseGate, TranslationRouter};
// use tokio_util::sync::CancellationToken;
//
// # async fn demo() {
// let config = EngineConfig::default();
// let events = Arc::new(EventBus::new());
// let gate = Arc::new(LicenseGate::new(
//     LicenseState::new(PlanType::Free, 100_000, chrono::Utc::now()),
//     Arc::clone(&events),
// ));
// let router = TranslationRouter::new(config, gate);
// let request = TranslationRequest::new("こんにちは", "ja", "en");
// let response = router.translate(&request, &CancellationToken::new()).await;
// # let _ = response;
// # }
// ```

// ── Honyaku Atoms (constants, error and data types) ────────────────────────
pub mod atoms;

// ── Honyaku Engine ─────────────────────────────────────────────────────────
pub mod engine;

pub use atoms::error::{CoreError, CoreResult};
pub use atoms::types::{TranslationRequest, TranslationResponse};
