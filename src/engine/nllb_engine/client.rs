// nllb_engine/client.rs — Translate RPCs against the NLLB server
//
// Single requests are one frame in, one frame out with a long read deadline.
// Batches are grouped by language pair, chunked to the server's batch limit,
// fanned out in parallel (bounded by the pool), and reassembled in input
// order; a failed batch falls back to retrying its members individually.
// Cancellation is honored between requests — a caller-scoped cancel never
// tears down the shared pool.

use crate::atoms::constants::SINGLE_READ_TIMEOUT_SECS;
use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{TranslationRequest, TranslationResponse};
use crate::engine::nllb_engine::connection::Connection;
use crate::engine::nllb_engine::manager::SubprocessManager;
use crate::engine::nllb_engine::pool::ConnectionPool;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const NLLB_PROVIDER_ID: &str = "nllb200";

// ── Wire shapes (newline-delimited JSON) ───────────────────────────────────

#[derive(Serialize)]
struct SingleRequestWire<'a> {
    text: &'a str,
    source_lang: &'a str,
    target_lang: &'a str,
    request_id: &'a str,
}

#[derive(Deserialize)]
struct SingleResponseWire {
    success: bool,
    #[serde(default)]
    translation: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    processing_time: Option<f64>,
}

#[derive(Serialize)]
struct BatchRequestWire<'a> {
    texts: Vec<&'a str>,
    source_lang: &'a str,
    target_lang: &'a str,
    batch_mode: bool,
    max_batch_size: usize,
}

#[derive(Deserialize)]
struct BatchResponseWire {
    success: bool,
    #[serde(default)]
    translations: Option<Vec<String>>,
    #[serde(default)]
    confidence_scores: Option<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    errors: Option<Vec<String>>,
}

// ── Client ─────────────────────────────────────────────────────────────────

pub struct SubprocessMtClient {
    pool: ConnectionPool,
    /// Absent in tests and when a caller wires the pool straight at an
    /// externally managed server.
    manager: Option<Arc<SubprocessManager>>,
    max_batch_size: usize,
}

impl SubprocessMtClient {
    pub fn new(
        pool: ConnectionPool,
        manager: Option<Arc<SubprocessManager>>,
        max_batch_size: usize,
    ) -> Self {
        SubprocessMtClient { pool, manager, max_batch_size }
    }

    pub fn shutdown_pool(&self) {
        self.pool.shutdown();
    }

    /// Block until the server has loaded its model (hard startup timeout).
    async fn ensure_ready(&self) -> CoreResult<()> {
        match &self.manager {
            Some(manager) => manager.wait_ready(manager.startup_timeout()).await,
            None => Ok(()),
        }
    }

    // ── Single ─────────────────────────────────────────────────────────────

    pub async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> TranslationResponse {
        let started = Instant::now();
        match self.translate_inner(request, cancel).await {
            Ok(response) => response.with_elapsed(started.elapsed()),
            Err(e) => TranslationResponse::fail(&request.request_id, NLLB_PROVIDER_ID, e)
                .with_elapsed(started.elapsed()),
        }
    }

    async fn translate_inner(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<TranslationResponse> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        self.ensure_ready().await?;
        let mut conn = self.pool.acquire(cancel).await?;
        exchange_single(&mut conn, request).await
    }

    // ── Batch ──────────────────────────────────────────────────────────────

    /// Translate many requests, preserving input order in the result.
    /// Partial results are always returned: every input gets exactly one
    /// response, error-filled where necessary.
    pub async fn translate_batch(
        &self,
        requests: &[TranslationRequest],
        cancel: &CancellationToken,
    ) -> Vec<TranslationResponse> {
        if requests.is_empty() {
            return Vec::new();
        }
        if let Err(e) = self.ensure_ready().await {
            return requests
                .iter()
                .map(|r| TranslationResponse::fail(&r.request_id, NLLB_PROVIDER_ID, e.clone()))
                .collect();
        }

        // Group input indices by (source, target), first-seen order.
        let mut groups: Vec<(String, String, Vec<usize>)> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            match groups
                .iter_mut()
                .find(|entry| entry.0 == request.source_language && entry.1 == request.target_language)
            {
                Some(entry) => entry.2.push(index),
                None => groups.push((
                    request.source_language.clone(),
                    request.target_language.clone(),
                    vec![index],
                )),
            }
        }

        let mut slots: Vec<Option<TranslationResponse>> =
            requests.iter().map(|_| None).collect();

        for (source, target, members) in &groups {
            // Chunks of one group run concurrently; the pool bounds the
            // fan-out to its capacity.
            let results = futures::future::join_all(
                members
                    .chunks(self.max_batch_size)
                    .map(|chunk| self.run_chunk(requests, chunk, source, target, cancel)),
            )
            .await;
            for chunk_result in results {
                for (index, response) in chunk_result {
                    slots[index] = Some(response);
                }
            }
        }

        // Reassemble in input order, matching by request identifier.
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    TranslationResponse::fail(
                        &requests[index].request_id,
                        NLLB_PROVIDER_ID,
                        CoreError::internal("batch response missing entry"),
                    )
                })
            })
            .collect()
    }

    /// One batch RPC for one chunk; falls back to individual requests when
    /// the batch exchange fails as a whole.
    async fn run_chunk(
        &self,
        requests: &[TranslationRequest],
        chunk: &[usize],
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Vec<(usize, TranslationResponse)> {
        if cancel.is_cancelled() {
            return chunk
                .iter()
                .map(|&i| {
                    (i, TranslationResponse::fail(&requests[i].request_id, NLLB_PROVIDER_ID, CoreError::Cancelled))
                })
                .collect();
        }

        match self.exchange_batch(requests, chunk, source, target, cancel).await {
            Ok(parsed) => {
                let translations = parsed.translations.unwrap_or_default();
                let confidences = parsed.confidence_scores.unwrap_or_default();
                let item_errors = parsed.errors.unwrap_or_default();
                chunk
                    .iter()
                    .enumerate()
                    .map(|(position, &index)| {
                        let request = &requests[index];
                        let response = match translations.get(position) {
                            Some(text) => {
                                let mut response = TranslationResponse::ok(
                                    &request.request_id,
                                    NLLB_PROVIDER_ID,
                                    text.clone(),
                                );
                                response.confidence = confidences.get(position).copied();
                                response.detected_language = Some(request.source_language.clone());
                                response
                            }
                            None => {
                                let error = item_errors
                                    .get(position)
                                    .map(|msg| CoreError::Processing(msg.clone()))
                                    .unwrap_or_else(|| {
                                        CoreError::protocol("batch response missing entry")
                                    });
                                TranslationResponse::fail(&request.request_id, NLLB_PROVIDER_ID, error)
                            }
                        };
                        (index, response)
                    })
                    .collect()
            }
            Err(batch_error) => {
                warn!(
                    "[nllb] batch of {} failed ({}), retrying individually",
                    chunk.len(),
                    batch_error
                );
                let mut results = Vec::with_capacity(chunk.len());
                for &index in chunk {
                    if cancel.is_cancelled() {
                        results.push((
                            index,
                            TranslationResponse::fail(
                                &requests[index].request_id,
                                NLLB_PROVIDER_ID,
                                CoreError::Cancelled,
                            ),
                        ));
                        continue;
                    }
                    results.push((index, self.translate(&requests[index], cancel).await));
                }
                results
            }
        }
    }

    async fn exchange_batch(
        &self,
        requests: &[TranslationRequest],
        chunk: &[usize],
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<BatchResponseWire> {
        let mut conn = self.pool.acquire(cancel).await?;
        let wire = BatchRequestWire {
            texts: chunk.iter().map(|&i| requests[i].text.as_str()).collect(),
            source_lang: source,
            target_lang: target,
            batch_mode: true,
            max_batch_size: self.max_batch_size,
        };
        conn.send_line(&wire).await?;
        let value = conn.read_line().await?;
        let parsed: BatchResponseWire = serde_json::from_value(value)
            .map_err(|e| CoreError::protocol(format!("batch response: {}", e)))?;

        // A whole-batch refusal (no per-item payload at all) becomes an
        // error so the chunk falls back to individual requests.
        if !parsed.success && parsed.translations.is_none() && parsed.errors.is_none() {
            return Err(CoreError::Processing(
                parsed.error.clone().unwrap_or_else(|| "batch rejected by server".into()),
            ));
        }
        Ok(parsed)
    }
}

async fn exchange_single(
    conn: &mut Connection,
    request: &TranslationRequest,
) -> CoreResult<TranslationResponse> {
    let wire = SingleRequestWire {
        text: &request.text,
        source_lang: &request.source_language,
        target_lang: &request.target_language,
        request_id: &request.request_id,
    };
    conn.send_line(&wire).await?;
    let value = conn
        .read_line_within(Duration::from_secs(SINGLE_READ_TIMEOUT_SECS))
        .await?;
    let parsed: SingleResponseWire = serde_json::from_value(value)
        .map_err(|e| CoreError::protocol(format!("translate response: {}", e)))?;

    if parsed.success {
        let text = parsed
            .translation
            .ok_or_else(|| CoreError::protocol("success response without translation"))?;
        let mut response = TranslationResponse::ok(&request.request_id, NLLB_PROVIDER_ID, text);
        response.confidence = parsed.confidence;
        response.detected_language = Some(request.source_language.clone());
        Ok(response)
    } else {
        Err(CoreError::Processing(
            parsed.error.unwrap_or_else(|| "server reported failure".into()),
        ))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
