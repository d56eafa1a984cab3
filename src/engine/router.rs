// Honyaku Engine — Backend router
//
// Walks the ordered route for each request: gate pre-check for cloud hops,
// dispatch with a per-hop deadline, breaker accounting for the subprocess
// backend, gate reconcile on every cloud outcome, and fallback on retryable
// failures. Non-retryable errors and cancellation return immediately; when
// every backend fails, the last error is annotated with the attempted chain.

use crate::atoms::error::CoreError;
use crate::atoms::types::{BackendKind, TranslationRequest, TranslationResponse};
use crate::engine::breaker::CircuitBreaker;
use crate::engine::config::EngineConfig;
use crate::engine::license::LicenseGate;
use crate::engine::local::LocalMtEngine;
use crate::engine::nllb_engine::SubprocessMtClient;
use crate::engine::relay::RelayClient;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const ROUTER_PROVIDER_ID: &str = "router";

pub struct TranslationRouter {
    config: EngineConfig,
    local: Option<Arc<LocalMtEngine>>,
    subprocess: Option<Arc<SubprocessMtClient>>,
    relay: Option<Arc<RelayClient>>,
    breaker: Arc<CircuitBreaker>,
    gate: Arc<LicenseGate>,
}

impl TranslationRouter {
    pub fn new(config: EngineConfig, gate: Arc<LicenseGate>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "nllb",
            crate::engine::breaker::BreakerConfig {
                failure_threshold: config.breaker.failure_threshold,
                cool_down: config.breaker.cool_down(),
            },
        ));
        TranslationRouter { config, local: None, subprocess: None, relay: None, breaker, gate }
    }

    pub fn with_local(mut self, engine: Arc<LocalMtEngine>) -> Self {
        self.local = Some(engine);
        self
    }

    pub fn with_subprocess(mut self, client: Arc<SubprocessMtClient>) -> Self {
        self.subprocess = Some(client);
        self
    }

    pub fn with_relay(mut self, relay: Arc<RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    fn available(&self) -> Vec<BackendKind> {
        let mut kinds = Vec::new();
        if self.local.is_some() {
            kinds.push(BackendKind::Local);
        }
        if self.subprocess.is_some() {
            kinds.push(BackendKind::Subprocess);
        }
        if self.relay.is_some() {
            kinds.push(BackendKind::Cloud);
        }
        kinds
    }

    /// Translate one request through the route, falling back across
    /// backends on retryable failures.
    pub async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> TranslationResponse {
        let route = self.config.route_for(&self.available());
        let mut attempted: Vec<&'static str> = Vec::new();
        let mut last: Option<TranslationResponse> = None;

        for hop in &route.hops {
            if cancel.is_cancelled() {
                return TranslationResponse::fail(
                    &request.request_id,
                    ROUTER_PROVIDER_ID,
                    CoreError::Cancelled,
                );
            }

            // Licensing gate runs before a cloud hop spends anything.
            if hop.backend == BackendKind::Cloud {
                if let Err(e) = self.gate.check_cloud_allowed(request.session_token.as_deref()) {
                    warn!("[router] cloud pre-check rejected: {}", e);
                    attempted.push(hop.backend.as_str());
                    last = Some(TranslationResponse::fail(
                        &request.request_id,
                        hop.backend.as_str(),
                        e,
                    ));
                    continue;
                }
            }

            let attempts = hop.attempts.max(1);
            for attempt in 0..attempts {
                if cancel.is_cancelled() {
                    return TranslationResponse::fail(
                        &request.request_id,
                        ROUTER_PROVIDER_ID,
                        CoreError::Cancelled,
                    );
                }
                let started = Instant::now();
                let response = self.dispatch(hop.backend, hop.timeout, request, cancel).await;
                let elapsed = started.elapsed();
                if attempt == 0 {
                    attempted.push(hop.backend.as_str());
                }

                match &response.error {
                    None => {
                        info!(
                            "[router] backend={} elapsed={}ms outcome=ok",
                            hop.backend.as_str(),
                            elapsed.as_millis()
                        );
                        if hop.backend == BackendKind::Cloud {
                            self.gate.reconcile(&response);
                        }
                        return response;
                    }
                    Some(error) => {
                        info!(
                            "[router] backend={} elapsed={}ms outcome={}",
                            hop.backend.as_str(),
                            elapsed.as_millis(),
                            error.code()
                        );
                        // A quota rejection carries the server's usage
                        // snapshot; fold it in so the UI can show the
                        // overage.
                        if hop.backend == BackendKind::Cloud {
                            self.gate.reconcile(&response);
                        }
                        if matches!(error, CoreError::Cancelled) {
                            return response;
                        }
                        if !error.is_retryable() {
                            return response;
                        }
                        last = Some(response);
                    }
                }
            }
        }

        let mut response = last.unwrap_or_else(|| {
            TranslationResponse::fail(
                &request.request_id,
                ROUTER_PROVIDER_ID,
                CoreError::internal("no translation backend available"),
            )
        });
        if let Some(error) = response.error.take() {
            response.error = Some(annotate_chain(error, &attempted));
        }
        response
    }

    async fn dispatch(
        &self,
        backend: BackendKind,
        deadline: Duration,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> TranslationResponse {
        match backend {
            BackendKind::Local => {
                let Some(engine) = self.local.clone() else {
                    return missing_backend(request, backend);
                };
                let owned = request.clone();
                let work = tokio::task::spawn_blocking(move || engine.translate(&owned));
                match tokio::time::timeout(deadline, work).await {
                    Err(_) => TranslationResponse::fail(
                        &request.request_id,
                        backend.as_str(),
                        CoreError::timeout(deadline),
                    ),
                    Ok(Err(join_error)) => TranslationResponse::fail(
                        &request.request_id,
                        backend.as_str(),
                        CoreError::internal(format!("local engine task: {}", join_error)),
                    ),
                    Ok(Ok(response)) => response,
                }
            }
            BackendKind::Subprocess => {
                let Some(client) = self.subprocess.as_ref() else {
                    return missing_backend(request, backend);
                };
                if let Err(e) = self.breaker.try_acquire() {
                    return TranslationResponse::fail(&request.request_id, backend.as_str(), e);
                }
                let response = match tokio::time::timeout(deadline, client.translate(request, cancel))
                    .await
                {
                    Err(_) => TranslationResponse::fail(
                        &request.request_id,
                        backend.as_str(),
                        CoreError::timeout(deadline),
                    ),
                    Ok(response) => response,
                };
                match &response.error {
                    None => self.breaker.record_success(),
                    Some(CoreError::Cancelled) => {}
                    // Transport-level faults trip the breaker; a responsive
                    // server refusing one request does not.
                    Some(error) if error.is_retryable() => self.breaker.record_failure(),
                    Some(_) => self.breaker.record_success(),
                }
                response
            }
            BackendKind::Cloud => {
                let Some(relay) = self.relay.as_ref() else {
                    return missing_backend(request, backend);
                };
                let token = request.session_token.clone().unwrap_or_default();
                let primary = self.config.cloud.primary_provider_id.clone();
                let response = relay.translate(request, &token, &primary).await;

                // A retryable primary failure gets one shot at the
                // secondary provider before the router moves on.
                let retry_secondary = matches!(&response.error, Some(e) if e.is_retryable());
                if retry_secondary {
                    if let Some(secondary) = self.config.cloud.secondary_provider_id.clone() {
                        if !cancel.is_cancelled() {
                            warn!(
                                "[router] primary provider {} failed, trying {}",
                                primary, secondary
                            );
                            return relay.translate(request, &token, &secondary).await;
                        }
                    }
                }
                response
            }
        }
    }
}

fn missing_backend(request: &TranslationRequest, backend: BackendKind) -> TranslationResponse {
    TranslationResponse::fail(
        &request.request_id,
        backend.as_str(),
        CoreError::internal(format!("backend {} is not configured", backend.as_str())),
    )
}

/// Append the attempted-backend chain to the message-bearing variants; unit
/// variants keep their crisp meaning.
fn annotate_chain(error: CoreError, attempted: &[&str]) -> CoreError {
    if attempted.is_empty() {
        return error;
    }
    let chain = attempted.join(" → ");
    match error {
        CoreError::Network(m) => CoreError::Network(format!("{} (attempted: {})", m, chain)),
        CoreError::Api { status, message } => CoreError::Api {
            status,
            message: format!("{} (attempted: {})", message, chain),
        },
        CoreError::Protocol(m) => CoreError::Protocol(format!("{} (attempted: {})", m, chain)),
        CoreError::Processing(m) => CoreError::Processing(format!("{} (attempted: {})", m, chain)),
        CoreError::Internal(m) => CoreError::Internal(format!("{} (attempted: {})", m, chain)),
        other => other,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
