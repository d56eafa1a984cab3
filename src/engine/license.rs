// Honyaku Engine — Quota / license gate
//
// Guards billable cloud calls and reconciles usage afterwards. The server's
// monthly_usage snapshot is authoritative whenever one is attached (it may
// even move backwards on an admin correction); local additive bumps are
// monotonic within a month. The bonus ledger tracks unsynced consumption as
// pending deltas so a server sync can never lose tokens to a race.
//
// Locking: one short mutex over {license, pending_consumption}; events are
// emitted after the lock is released.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{
    add_one_month, month_key, BonusToken, LicenseState, MonthlyUsage, PlanType, PromotionState,
    TranslationResponse,
};
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::relay::client::{RelayClient, SyncInitState};
use crate::engine::relay::wire::BonusSyncEntryWire;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct GateInner {
    license: LicenseState,
    /// Locally consumed but not yet server-acknowledged, bonus id → delta.
    pending_consumption: HashMap<String, u64>,
}

pub struct LicenseGate {
    inner: Mutex<GateInner>,
    events: Arc<EventBus>,
}

impl LicenseGate {
    pub fn new(initial: LicenseState, events: Arc<EventBus>) -> Self {
        LicenseGate {
            inner: Mutex::new(GateInner { license: initial, pending_consumption: HashMap::new() }),
            events,
        }
    }

    pub fn snapshot(&self) -> LicenseState {
        self.inner.lock().license.clone()
    }

    pub fn total_bonus_remaining(&self) -> u64 {
        let now = Utc::now();
        self.inner
            .lock()
            .license
            .bonus_tokens
            .iter()
            .filter(|b| b.is_usable(now))
            .map(|b| b.remaining())
            .sum()
    }

    // ── Pre-call gate ──────────────────────────────────────────────────────

    /// Reject a cloud-backed request before it costs anything.
    pub fn check_cloud_allowed(&self, session_token: Option<&str>) -> CoreResult<()> {
        self.check_cloud_allowed_at(Utc::now(), session_token)
    }

    fn check_cloud_allowed_at(
        &self,
        now: DateTime<Utc>,
        session_token: Option<&str>,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.license.plan.allows_cloud() {
            return Err(CoreError::PlanNotSupported(format!(
                "cloud translation requires a paid plan (current: {})",
                inner.license.plan.as_str()
            )));
        }
        if session_token.map_or(true, |t| t.is_empty()) {
            return Err(CoreError::SessionInvalid);
        }
        rollover_if_needed(&mut inner.license.monthly_usage, now);
        let bonus_left: u64 = inner
            .license
            .bonus_tokens
            .iter()
            .filter(|b| b.is_usable(now))
            .map(|b| b.remaining())
            .sum();
        if inner.license.monthly_usage.is_exceeded() && bonus_left == 0 {
            return Err(CoreError::QuotaExceeded);
        }
        Ok(())
    }

    // ── Post-call reconcile ────────────────────────────────────────────────

    /// Fold one cloud response into the snapshot. A server-attached
    /// monthly_usage replaces the local view even when the call failed
    /// (the QUOTA_EXCEEDED path); a plain success applies a local additive
    /// bump.
    pub fn reconcile(&self, response: &TranslationResponse) {
        self.reconcile_at(Utc::now(), response);
    }

    fn reconcile_at(&self, now: DateTime<Utc>, response: &TranslationResponse) {
        let mut emitted = None;
        {
            let mut inner = self.inner.lock();
            if let Some(server) = &response.monthly_usage {
                inner.license.monthly_usage = server.clone();
                inner.license.last_server_sync = Some(now);
                emitted = Some(EngineEvent::LicenseUpdated {
                    plan: inner.license.plan,
                    monthly_usage: inner.license.monthly_usage.clone(),
                });
            } else if response.success {
                rollover_if_needed(&mut inner.license.monthly_usage, now);
                let spent = response.token_usage.total_tokens();
                if spent > 0 {
                    inner.license.monthly_usage.tokens_used += spent;
                    emitted = Some(EngineEvent::LicenseUpdated {
                        plan: inner.license.plan,
                        monthly_usage: inner.license.monthly_usage.clone(),
                    });
                }
            }
        }
        if let Some(event) = emitted {
            self.events.emit(event);
        }
    }

    // ── Bonus ledger ───────────────────────────────────────────────────────

    /// Withdraw up to `amount` from usable bonuses, ascending expiry (ties
    /// by id). Returns what was actually consumed.
    pub fn consume_bonus(&self, amount: u64) -> u64 {
        self.consume_bonus_at(Utc::now(), amount)
    }

    fn consume_bonus_at(&self, now: DateTime<Utc>, amount: u64) -> u64 {
        let (consumed, remaining_after) = {
            let mut inner = self.inner.lock();

            let mut order: Vec<usize> = (0..inner.license.bonus_tokens.len()).collect();
            order.sort_by(|&a, &b| {
                let ta = &inner.license.bonus_tokens[a];
                let tb = &inner.license.bonus_tokens[b];
                let ka = ta.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
                let kb = tb.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
                ka.cmp(&kb).then_with(|| ta.id.cmp(&tb.id))
            });

            let mut outstanding = amount;
            for index in order {
                if outstanding == 0 {
                    break;
                }
                let bonus = &mut inner.license.bonus_tokens[index];
                if !bonus.is_usable(now) {
                    continue;
                }
                let take = bonus.remaining().min(outstanding);
                bonus.used_tokens += take;
                outstanding -= take;
                let id = bonus.id.clone();
                *inner.pending_consumption.entry(id).or_insert(0) += take;
            }

            let remaining_after: u64 = inner
                .license
                .bonus_tokens
                .iter()
                .filter(|b| b.is_usable(now))
                .map(|b| b.remaining())
                .sum();
            (amount - outstanding, remaining_after)
        };

        if consumed > 0 {
            self.events.emit(EngineEvent::BonusChanged { total_remaining: remaining_after });
        }
        consumed
    }

    /// Push pending deltas to the server and fold its echo back in.
    pub async fn sync_to_server(&self, relay: &RelayClient, session_token: &str) -> CoreResult<()> {
        let (entries, deltas) = self.pending_snapshot();
        if entries.is_empty() {
            return Ok(());
        }
        info!("[license] syncing {} bonus entries", entries.len());
        let echoes = relay.sync_bonus_tokens(session_token, entries).await?;
        self.apply_bonus_sync(&echoes, &deltas);
        Ok(())
    }

    /// Consistent view of what needs syncing: `{id, used_tokens}` snapshots
    /// plus the delta set they cover.
    fn pending_snapshot(&self) -> (Vec<BonusSyncEntryWire>, HashMap<String, u64>) {
        let inner = self.inner.lock();
        let entries = inner
            .pending_consumption
            .keys()
            .filter_map(|id| {
                inner
                    .license
                    .bonus_tokens
                    .iter()
                    .find(|b| &b.id == id)
                    .map(|b| BonusSyncEntryWire { id: b.id.clone(), used_tokens: b.used_tokens })
            })
            .collect();
        (entries, inner.pending_consumption.clone())
    }

    /// Apply the server's echoed counts. Local counts only move up
    /// (`max(local, echo)`), and each synced id's pending delta shrinks by
    /// exactly what the snapshot covered — consumption that raced with the
    /// sync stays pending for the next round.
    fn apply_bonus_sync(
        &self,
        echoes: &[BonusSyncEntryWire],
        synced: &HashMap<String, u64>,
    ) {
        let remaining_after = {
            let mut inner = self.inner.lock();
            for echo in echoes {
                if let Some(bonus) =
                    inner.license.bonus_tokens.iter_mut().find(|b| b.id == echo.id)
                {
                    bonus.used_tokens = bonus.used_tokens.max(echo.used_tokens);
                }
            }
            for (id, delta) in synced {
                if let Some(pending) = inner.pending_consumption.get_mut(id) {
                    *pending = pending.saturating_sub(*delta);
                    if *pending == 0 {
                        inner.pending_consumption.remove(id);
                    }
                }
            }
            inner.license.last_server_sync = Some(Utc::now());
            let now = Utc::now();
            inner
                .license
                .bonus_tokens
                .iter()
                .filter(|b| b.is_usable(now))
                .map(|b| b.remaining())
                .sum()
        };
        self.events.emit(EngineEvent::BonusChanged { total_remaining: remaining_after });
    }

    // ── Promotion ──────────────────────────────────────────────────────────

    /// Apply a redeemed code. An already-valid Pro-or-higher promotion is
    /// extended one month past its current expiry; anything else gets a
    /// fresh month from now.
    pub fn apply_promotion(&self, code: &str, plan: PlanType) -> PromotionState {
        self.apply_promotion_at(Utc::now(), code, plan)
    }

    fn apply_promotion_at(
        &self,
        now: DateTime<Utc>,
        code: &str,
        plan: PlanType,
    ) -> PromotionState {
        let (promotion, monthly, plan_after) = {
            let mut inner = self.inner.lock();
            let expires_at = match &inner.license.promotion {
                Some(existing) if existing.is_valid(now) && existing.plan >= PlanType::Pro => {
                    add_one_month(existing.expires_at)
                }
                _ => add_one_month(now),
            };
            let promotion = PromotionState {
                code: code.to_string(),
                plan,
                applied_at: now,
                expires_at,
            };
            inner.license.promotion = Some(promotion.clone());
            inner.license.plan = inner.license.plan.max(plan);
            inner.license.plan_expires_at = Some(expires_at);
            (promotion, inner.license.monthly_usage.clone(), inner.license.plan)
        };

        info!(
            "[license] promotion `{}` applied, plan {} until {}",
            promotion.code,
            promotion.plan.as_str(),
            promotion.expires_at
        );
        self.events.emit(EngineEvent::PromotionChanged {
            code: promotion.code.clone(),
            plan: promotion.plan,
            expires_at: promotion.expires_at,
        });
        self.events.emit(EngineEvent::LicenseUpdated { plan: plan_after, monthly_usage: monthly });
        promotion
    }

    // ── Server adoption ────────────────────────────────────────────────────

    /// Replace local snapshots with whatever a sync-init brought back.
    pub fn adopt_sync_init(&self, state: &SyncInitState) {
        let mut events = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(quota) = &state.quota {
                inner.license.monthly_usage = quota.clone();
                events.push(EngineEvent::LicenseUpdated {
                    plan: inner.license.plan,
                    monthly_usage: quota.clone(),
                });
            }
            if !state.bonus_tokens.is_empty() {
                let merged = merge_bonus(
                    std::mem::take(&mut inner.license.bonus_tokens),
                    &state.bonus_tokens,
                    &inner.pending_consumption,
                );
                inner.license.bonus_tokens = merged;
                let now = Utc::now();
                events.push(EngineEvent::BonusChanged {
                    total_remaining: inner
                        .license
                        .bonus_tokens
                        .iter()
                        .filter(|b| b.is_usable(now))
                        .map(|b| b.remaining())
                        .sum(),
                });
            }
            if let Some(promotion) = &state.promotion {
                inner.license.promotion = Some(promotion.clone());
                inner.license.plan = inner.license.plan.max(promotion.plan);
                inner.license.plan_expires_at = Some(promotion.expires_at);
                events.push(EngineEvent::PromotionChanged {
                    code: promotion.code.clone(),
                    plan: promotion.plan,
                    expires_at: promotion.expires_at,
                });
            }
            inner.license.last_server_sync = Some(Utc::now());
        }
        if state.partial_failure {
            warn!("[license] sync init was partial: {:?}", state.failed_components);
        }
        for event in events {
            self.events.emit(event);
        }
    }
}

/// Server list wins, but unsynced local consumption stays counted:
/// `used = max(server_used, server_used + pending_delta)` per id.
fn merge_bonus(
    _local: Vec<BonusToken>,
    server: &[BonusToken],
    pending: &HashMap<String, u64>,
) -> Vec<BonusToken> {
    server
        .iter()
        .map(|b| {
            let mut merged = b.clone();
            if let Some(delta) = pending.get(&b.id) {
                merged.used_tokens =
                    (merged.used_tokens + delta).min(merged.granted_tokens);
            }
            merged
        })
        .collect()
}

fn rollover_if_needed(usage: &mut MonthlyUsage, now: DateTime<Utc>) {
    let current = month_key(now);
    if usage.year_month != current {
        info!("[license] month rollover {} → {}", usage.year_month, current);
        *usage = MonthlyUsage::new(current, 0, usage.tokens_limit);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
