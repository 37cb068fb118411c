//! Recognition orchestrator.
//!
//! Ties the pieces together for one request:
//!
//! ```text
//! screenshot -> fingerprint -> cache lookup --hit--> result
//!                                  |
//!                                 miss -> fallback controller -> result -> cache put
//! ```
//!
//! At most one recognition runs at a time; a second request while one is in
//! flight is rejected with `Busy`. `cancel()` abandons the running request
//! from any thread and the caller sees `Cancelled` right away.

use crate::backends::build_adapters;
use crate::backends::normalize::{classify_status, NormalizeOptions};
use crate::cache::{CacheError, CacheStats, ResultCache};
use crate::capture::Screenshot;
use crate::config::Config;
use crate::consent::ConsentGate;
use crate::fallback::{FallbackController, FallbackOutcome};
use crate::fingerprint::ContentFingerprint;
use crate::handoff::{Handoff, RecognitionEvent};
use crate::types::{BackendKind, RecognitionError, RecognitionResult};
use chrono::{DateTime, SubsecRound, Utc};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters over the orchestrator's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Requests accepted
    pub recognitions: u64,
    pub cache_hits: u64,
    /// Results produced by a backend
    pub backend_results: u64,
    /// Backend results that needed more than one backend
    pub fallbacks: u64,
    pub remote_uses: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub busy_rejections: u64,
}

#[derive(Default)]
struct Counters {
    recognitions: AtomicU64,
    cache_hits: AtomicU64,
    backend_results: AtomicU64,
    fallbacks: AtomicU64,
    remote_uses: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    busy_rejections: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            recognitions: self.recognitions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            backend_results: self.backend_results.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            remote_uses: self.remote_uses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
        }
    }
}

/// The single in-flight slot
#[derive(Default)]
struct FlightState {
    busy: AtomicBool,
    token: Mutex<Option<CancellationToken>>,
}

/// Held for the duration of one request; frees the slot when dropped
struct FlightGuard {
    state: Arc<FlightState>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Clear the token before freeing the slot so a new request's token
        // is never removed
        if let Ok(mut slot) = self.state.token.lock() {
            slot.take();
        }
        self.state.busy.store(false, Ordering::SeqCst);
    }
}

pub struct RecognitionOrchestrator {
    controller: FallbackController,
    cache: Option<Arc<ResultCache>>,
    handoff: Option<Handoff>,
    ttl: Duration,
    partial_threshold: f32,
    flight: Arc<FlightState>,
    counters: Counters,
}

impl RecognitionOrchestrator {
    pub fn new(
        config: &Config,
        controller: FallbackController,
        cache: Option<Arc<ResultCache>>,
        handoff: Option<Handoff>,
    ) -> Self {
        let ttl = cache
            .as_ref()
            .map(|c| c.ttl())
            .unwrap_or_else(|| config.cache.ttl());

        Self {
            controller,
            cache,
            handoff,
            ttl,
            partial_threshold: config.recognition.partial_threshold,
            flight: Arc::new(FlightState::default()),
            counters: Counters::default(),
        }
    }

    /// Build the full engine from configuration: backends in configured
    /// order, and the persistent cache when enabled. A cache that cannot be
    /// opened is logged and recognition runs uncached.
    pub fn from_config(config: &Config, consent: Arc<dyn ConsentGate>, handoff: Handoff) -> Self {
        let controller = FallbackController::new(
            build_adapters(config),
            consent,
            &config.timing,
            NormalizeOptions::from_config(&config.recognition),
        );

        let cache = if config.cache.enabled {
            match ResultCache::from_config(&config.cache) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    error!("Result cache unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            info!("Result cache disabled");
            None
        };

        Self::new(config, controller, cache, Some(handoff))
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn cache_stats(&self) -> Option<Result<CacheStats, CacheError>> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn is_busy(&self) -> bool {
        self.flight.busy.load(Ordering::SeqCst)
    }

    /// Recognize a screenshot and wait for the outcome
    pub async fn recognize(
        &self,
        screenshot: &Screenshot,
    ) -> Result<RecognitionResult, RecognitionError> {
        let (guard, token) = self.begin()?;
        let outcome = match AssertUnwindSafe(self.execute(&token, screenshot))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Recognition panicked: {}", message);
                Err(RecognitionError::Internal(format!(
                    "recognition panicked: {}",
                    message
                )))
            }
        };
        drop(guard);

        self.record(&outcome);
        outcome
    }

    /// Start recognition on a background task and deliver the outcome
    /// through the handoff. Rejected immediately with `Busy` when a request
    /// is already in flight.
    pub fn submit(
        self: &Arc<Self>,
        screenshot: Screenshot,
    ) -> Result<JoinHandle<()>, RecognitionError> {
        let (guard, token) = self.begin()?;
        let this = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let worker = {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.execute(&token, &screenshot).await })
            };

            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Recognition worker failed: {}", e);
                    Err(RecognitionError::Internal(format!(
                        "recognition worker failed: {}",
                        e
                    )))
                }
            };

            // Free the slot before delivery so the consumer can submit again
            // as soon as it sees the outcome
            drop(guard);
            this.record(&outcome);

            let event = match outcome {
                Ok(result) => RecognitionEvent::Completed(result),
                Err(e) => RecognitionEvent::Failed(e),
            };
            if let Some(handoff) = &this.handoff {
                if !handoff.deliver(event).await {
                    warn!("Consumer gone, recognition outcome dropped");
                }
            }
        }))
    }

    /// Cancel the in-flight request. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        let slot = match self.flight.token.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };

        match slot.as_ref() {
            Some(token) => {
                info!("Cancelling recognition");
                token.cancel();
                true
            }
            None => {
                debug!("Cancel requested with nothing in flight");
                false
            }
        }
    }

    fn begin(&self) -> Result<(FlightGuard, CancellationToken), RecognitionError> {
        if self
            .flight
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            Counters::bump(&self.counters.busy_rejections);
            info!("Recognition already in progress, rejecting request");
            return Err(RecognitionError::Busy);
        }

        let guard = FlightGuard {
            state: Arc::clone(&self.flight),
        };

        let token = CancellationToken::new();
        let mut slot = self
            .flight
            .token
            .lock()
            .map_err(|_| RecognitionError::Internal("in-flight state poisoned".to_string()))?;
        *slot = Some(token.clone());
        drop(slot);

        Counters::bump(&self.counters.recognitions);
        Ok((guard, token))
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        screenshot: &Screenshot,
    ) -> Result<RecognitionResult, RecognitionError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Recognition cancelled");
                Err(RecognitionError::Cancelled)
            }
            result = self.pipeline(screenshot) => result,
        }
    }

    async fn pipeline(&self, screenshot: &Screenshot) -> Result<RecognitionResult, RecognitionError> {
        let started = Instant::now();
        let fingerprint = screenshot.fingerprint();
        debug!(
            "Recognizing {} ({}x{}, {})",
            fingerprint.short(),
            screenshot.width(),
            screenshot.height(),
            screenshot.source_label
        );

        if let Some(hit) = self.lookup_cached(fingerprint).await {
            Counters::bump(&self.counters.cache_hits);
            info!(
                "Cache hit for {}: {} elements",
                fingerprint.short(),
                hit.elements.len()
            );
            return Ok(hit);
        }

        let handoff = self.handoff.clone();
        let outcome = self
            .controller
            .run(screenshot, move |elapsed| {
                if let Some(handoff) = handoff {
                    handoff.notify(RecognitionEvent::Progress { elapsed });
                }
            })
            .await
            .map_err(|last| {
                warn!("All backends failed for {}: {}", fingerprint.short(), last);
                RecognitionError::AllBackendsFailed { last }
            })?;

        self.note_outcome(&outcome);
        let result = self.build_result(fingerprint, outcome, started.elapsed());
        self.write_through(&result).await;

        info!(
            "Recognized {} elements {} in {}ms ({})",
            result.elements.len(),
            result.backend_used.spoken(),
            result.latency_ms,
            result.status.as_str()
        );
        Ok(result)
    }

    fn build_result(
        &self,
        fingerprint: ContentFingerprint,
        outcome: FallbackOutcome,
        elapsed: Duration,
    ) -> RecognitionResult {
        // Millisecond precision, matching what the cache stores
        let created_at = Utc::now().trunc_subsecs(3);
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let status = classify_status(&outcome.elements, self.partial_threshold);

        RecognitionResult {
            fingerprint,
            elements: outcome.elements,
            backend_used: outcome.backend,
            model_name: outcome.model_name,
            latency_ms: elapsed.as_millis() as u64,
            status,
            created_at,
            expires_at,
            from_cache: false,
        }
    }

    fn note_outcome(&self, outcome: &FallbackOutcome) {
        Counters::bump(&self.counters.backend_results);
        if outcome.fell_back() {
            Counters::bump(&self.counters.fallbacks);
        }
        if outcome.backend == BackendKind::RemoteApi {
            Counters::bump(&self.counters.remote_uses);
        }
    }

    async fn lookup_cached(&self, fingerprint: ContentFingerprint) -> Option<RecognitionResult> {
        let cache = Arc::clone(self.cache.as_ref()?);

        match tokio::task::spawn_blocking(move || cache.lookup(&fingerprint)).await {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                warn!("Cache lookup failed, treating as miss: {}", e);
                None
            }
            Err(e) => {
                warn!("Cache lookup task failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Storage failures are logged; the result is still returned
    async fn write_through(&self, result: &RecognitionResult) {
        let Some(cache) = self.cache.as_ref().map(Arc::clone) else {
            return;
        };
        let entry = result.clone();

        match tokio::task::spawn_blocking(move || cache.put(&entry.fingerprint, &entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to cache result: {}", e),
            Err(e) => warn!("Cache write task failed: {}", e),
        }
    }

    fn record(&self, outcome: &Result<RecognitionResult, RecognitionError>) {
        match outcome {
            Ok(_) => {}
            Err(RecognitionError::Cancelled) => Counters::bump(&self.counters.cancellations),
            Err(_) => Counters::bump(&self.counters.failures),
        }
    }
}

/// Text of a panic payload, for logs
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
