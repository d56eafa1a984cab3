// Honyaku Engine — Real-time game-text translation core
//
// Three backends behind one router: an on-device ONNX OPUS-MT engine, a
// long-lived NLLB-200 inference server over local TCP, and the cloud relay.
// The license gate meters cloud traffic; events carry state changes out.

pub mod breaker;
pub mod config;
pub mod events;
pub mod license;
pub mod local;
pub mod nllb_engine;
pub mod relay;
pub mod router;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::EngineConfig;
pub use events::{EngineEvent, EventBus, EventKind};
pub use license::LicenseGate;
pub use router::TranslationRouter;
