//! Vision Navigator - screen element recognition orchestrator
//!
//! This crate turns a screenshot into a spoken, navigable list of UI elements
//! for a screen reader. Recognition is dispatched to one of several
//! interchangeable backends:
//!
//! - **Accelerated-Local**: local model on the GPU
//! - **CPU-Local**: local model on the CPU
//! - **Remote-API**: hosted vision model, only with user consent
//!
//! # Architecture
//!
//! Screenshots are fingerprinted by content and looked up in a persistent
//! SQLite cache with TTL expiry and LRU eviction. On a miss the fallback
//! controller tries the backends in order, each under its own timeout, and
//! the result is written through to the cache. The orchestrator runs one
//! recognition at a time, supports cancellation and hands outcomes to the
//! consumer, which drives the element navigation state.

pub mod backends;
pub mod cache;
pub mod capture;
pub mod config;
pub mod consent;
pub mod consumer;
pub mod describe;
pub mod fallback;
pub mod fingerprint;
pub mod handoff;
pub mod navigation;
pub mod orchestrator;
pub mod types;

// Re-export commonly used types
pub use backends::normalize::NormalizeOptions;
pub use backends::{build_adapters, BackendAdapter, LocalModelAdapter, RemoteApiAdapter};
pub use cache::{CacheError, CacheStats, ResultCache};
pub use capture::{CaptureDescriptor, CaptureError, CaptureService, FileCapture, Screenshot};
pub use config::{ConsentPolicy, Config};
pub use consent::{Capability, ConsentGate, PolicyConsent};
pub use consumer::{AnnounceSink, ConsumerSession};
pub use describe::{describe_element, summarize};
pub use fallback::{FallbackController, FallbackOutcome};
pub use fingerprint::{ContentFingerprint, ContentHasher};
pub use handoff::{ConsumerQueue, Handoff, RecognitionEvent};
pub use navigation::{Move, NavigationError, NavigationState};
pub use orchestrator::{EngineStats, RecognitionOrchestrator};
pub use types::{
    BackendKind, BoundingBox, ElementType, FailureKind, RecognitionError, RecognitionResult,
    RecognitionStatus, UIElement,
};
