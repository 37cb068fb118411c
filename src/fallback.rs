//! Multi-backend fallback.
//!
//! Backends are tried in configured order. Each attempt gets the full
//! per-attempt timeout; a backend that is not ready, times out, errors or
//! returns unusable output hands over to the next one. Only running out of
//! backends is reported to the caller, carrying the last failure.
//!
//! Backends that send screen content off the device are skipped unless the
//! consent gate allows them. Independently of which backend is running, one
//! progress notification is raised once the request has taken longer than the
//! progress threshold.

use crate::backends::normalize::NormalizeOptions;
use crate::backends::BackendAdapter;
use crate::capture::Screenshot;
use crate::config::TimingConfig;
use crate::consent::{Capability, ConsentGate};
use crate::types::{BackendKind, FailureKind, UIElement};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Successful run of the controller
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub elements: Vec<UIElement>,
    pub backend: BackendKind,
    pub model_name: String,
    /// Backends that failed before the one that succeeded, in order
    pub failures: Vec<(BackendKind, FailureKind)>,
}

impl FallbackOutcome {
    /// Whether an earlier backend had to be skipped
    pub fn fell_back(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct FallbackController {
    adapters: Vec<Arc<dyn BackendAdapter>>,
    consent: Arc<dyn ConsentGate>,
    attempt_timeout: Duration,
    progress_threshold: Duration,
    options: NormalizeOptions,
}

impl FallbackController {
    pub fn new(
        adapters: Vec<Arc<dyn BackendAdapter>>,
        consent: Arc<dyn ConsentGate>,
        timing: &TimingConfig,
        options: NormalizeOptions,
    ) -> Self {
        Self {
            adapters,
            consent,
            attempt_timeout: timing.attempt_timeout(),
            progress_threshold: timing.progress_threshold(),
            options,
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn BackendAdapter>] {
        &self.adapters
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    /// Run the backends until one succeeds.
    ///
    /// `on_progress` is called at most once, with the elapsed time, if the
    /// whole run outlasts the progress threshold.
    pub async fn run<F>(
        &self,
        screenshot: &Screenshot,
        on_progress: F,
    ) -> Result<FallbackOutcome, FailureKind>
    where
        F: FnOnce(Duration) + Send,
    {
        let started = Instant::now();
        let mut on_progress = Some(on_progress);

        let progress_timer = tokio::time::sleep(self.progress_threshold);
        tokio::pin!(progress_timer);

        let attempts = self.attempt_all(screenshot);
        tokio::pin!(attempts);

        loop {
            tokio::select! {
                result = &mut attempts => return result,
                _ = &mut progress_timer, if on_progress.is_some() => {
                    if let Some(notify) = on_progress.take() {
                        debug!("Recognition still running after {:?}", started.elapsed());
                        notify(started.elapsed());
                    }
                }
            }
        }
    }

    async fn attempt_all(&self, screenshot: &Screenshot) -> Result<FallbackOutcome, FailureKind> {
        let mut failures: Vec<(BackendKind, FailureKind)> = Vec::new();

        for adapter in &self.adapters {
            let kind = adapter.kind();

            // Never ask for consent on behalf of a backend that cannot run
            if !adapter.ready() {
                debug!("Skipping {}: not ready", kind.as_str());
                failures.push((
                    kind,
                    FailureKind::Unavailable(format!("{} not ready", adapter.model_name())),
                ));
                continue;
            }

            if kind.requires_consent() && !self.consent_granted().await {
                info!("Skipping {}: consent not granted", kind.as_str());
                failures.push((
                    kind,
                    FailureKind::Unavailable("consent not granted".to_string()),
                ));
                continue;
            }

            let attempt_started = Instant::now();
            let attempt = adapter.infer(screenshot, self.attempt_timeout, &self.options);

            let failure = match tokio::time::timeout(self.attempt_timeout, attempt).await {
                Ok(Ok(elements)) => {
                    info!(
                        "{} recognized {} elements in {:?}",
                        kind.as_str(),
                        elements.len(),
                        attempt_started.elapsed()
                    );
                    return Ok(FallbackOutcome {
                        elements,
                        backend: kind,
                        model_name: adapter.model_name().to_string(),
                        failures,
                    });
                }
                Ok(Err(FailureKind::InvalidResponse(msg))) => {
                    FailureKind::TransientError(format!("invalid response: {}", msg))
                }
                Ok(Err(failure)) => failure,
                Err(_) => FailureKind::Timeout,
            };

            warn!(
                "{} failed after {:?}: {}",
                kind.as_str(),
                attempt_started.elapsed(),
                failure
            );
            failures.push((kind, failure));
        }

        match failures.pop() {
            Some((_, last)) => Err(last),
            None => Err(FailureKind::Unavailable("no backends configured".to_string())),
        }
    }

    async fn consent_granted(&self) -> bool {
        let capability = Capability::RemoteInference;
        self.consent.is_consent_granted(capability)
            || self.consent.request_consent(capability).await
    }
}
