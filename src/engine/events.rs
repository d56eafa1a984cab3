// Honyaku Engine — State-change notifications
//
// Each state holder (license gate, subprocess manager) emits events through
// a shared `EventBus` after releasing its lock; UI layers and tests consume
// them as a filtered stream. There is no implicit event bus: `subscribe` is
// the whole contract.

use crate::atoms::types::{MonthlyUsage, PlanType};
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Coarse event families for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Promotion,
    Bonus,
    License,
    Server,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A promotion code was applied or extended.
    PromotionChanged {
        code: String,
        plan: PlanType,
        expires_at: DateTime<Utc>,
    },
    /// The bonus-token ledger changed (consumption or server sync).
    BonusChanged { total_remaining: u64 },
    /// The license snapshot changed (plan, monthly usage, server resync).
    LicenseUpdated {
        plan: PlanType,
        monthly_usage: MonthlyUsage,
    },
    /// The NLLB server finished loading its model.
    ServerReady { port: u16, language_pair: String },
    /// The NLLB server process exited.
    ServerExited { exit_code: Option<i32> },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::PromotionChanged { .. } => EventKind::Promotion,
            EngineEvent::BonusChanged { .. } => EventKind::Bonus,
            EngineEvent::LicenseUpdated { .. } => EventKind::License,
            EngineEvent::ServerReady { .. } | EngineEvent::ServerExited { .. } => EventKind::Server,
        }
    }
}

// ── Bus ────────────────────────────────────────────────────────────────────

pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Fire-and-forget. Emitters must not hold their state lock across this
    /// call; a bus with no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        debug!("[events] {:?}", event.kind());
        let _ = self.tx.send(event);
    }

    /// Stream of events, optionally filtered to one kind. Slow subscribers
    /// that lag past the channel capacity silently lose the overwritten
    /// events (they are notifications, not a ledger).
    pub fn subscribe(
        &self,
        kind: Option<EventKind>,
    ) -> impl Stream<Item = EngineEvent> + Send + Unpin {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(event) if kind.is_none() || kind == Some(event.kind()) => Some(event),
            _ => None,
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_emitted_event() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(None);
        bus.emit(EngineEvent::BonusChanged { total_remaining: 42 });
        let event = stream.next().await.unwrap();
        assert!(matches!(event, EngineEvent::BonusChanged { total_remaining: 42 }));
    }

    #[tokio::test]
    async fn test_kind_filter_drops_other_events() {
        let bus = EventBus::new();
        let mut servers = bus.subscribe(Some(EventKind::Server));
        bus.emit(EngineEvent::BonusChanged { total_remaining: 1 });
        bus.emit(EngineEvent::ServerReady { port: 5555, language_pair: "ja-en".into() });
        let event = servers.next().await.unwrap();
        assert!(matches!(event, EngineEvent::ServerReady { port: 5555, .. }));
    }
}
