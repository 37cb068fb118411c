//! Recognition backends.
//!
//! Three interchangeable backends can read a screenshot:
//! - Accelerated-Local: a local model on the GPU
//! - CPU-Local: the same kind of model on the CPU
//! - Remote-API: a hosted vision model (needs consent and an API key)
//!
//! They differ only in the resources they use. Each one returns raw model
//! output, and `normalize` turns it into elements the same way for all of
//! them.

pub mod local;
pub mod normalize;
pub mod remote;

use crate::capture::Screenshot;
use crate::config::Config;
use crate::types::{BackendKind, FailureKind, UIElement};
use normalize::{normalize_output, NormalizeOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use local::LocalModelAdapter;
pub use remote::RemoteApiAdapter;

/// Trait for recognition backends
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Model or service name reported in results
    fn model_name(&self) -> &str;

    /// Whether the backend can take a request right now
    fn ready(&self) -> bool;

    /// Run the model and return its raw output
    async fn run_model(
        &self,
        screenshot: &Screenshot,
        deadline: Duration,
    ) -> Result<String, FailureKind>;

    /// Recognize the elements in a screenshot
    async fn infer(
        &self,
        screenshot: &Screenshot,
        deadline: Duration,
        options: &NormalizeOptions,
    ) -> Result<Vec<UIElement>, FailureKind> {
        let raw = self.run_model(screenshot, deadline).await?;
        normalize_output(&raw, screenshot.width(), screenshot.height(), options)
    }
}

/// Build the enabled backends in configured order
pub fn build_adapters(config: &Config) -> Vec<Arc<dyn BackendAdapter>> {
    let mut adapters: Vec<Arc<dyn BackendAdapter>> = Vec::new();
    let mut seen = Vec::new();

    for kind in &config.backends.order {
        if seen.contains(kind) {
            warn!("Backend {} listed twice, ignoring repeat", kind.as_str());
            continue;
        }
        seen.push(*kind);

        let adapter: Arc<dyn BackendAdapter> = match kind {
            BackendKind::AcceleratedLocal if config.backends.accelerated.enabled => {
                Arc::new(LocalModelAdapter::accelerated(&config.backends.accelerated))
            }
            BackendKind::CpuLocal if config.backends.cpu.enabled => {
                Arc::new(LocalModelAdapter::cpu(&config.backends.cpu))
            }
            BackendKind::RemoteApi if config.backends.remote.enabled => {
                match RemoteApiAdapter::from_config(&config.backends.remote) {
                    Ok(adapter) => Arc::new(adapter),
                    Err(e) => {
                        warn!("Remote backend disabled: {}", e);
                        continue;
                    }
                }
            }
            _ => {
                debug!("Backend {} disabled in config", kind.as_str());
                continue;
            }
        };

        info!(
            "Backend {} ({}): {}",
            kind.as_str(),
            adapter.model_name(),
            if adapter.ready() { "ready" } else { "not ready" }
        );
        adapters.push(adapter);
    }

    adapters
}
