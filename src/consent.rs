//! Consent for sending screen content off the device.

use crate::config::{ConsentPolicy, PrivacyConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Something the user has to agree to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Send screenshots to a remote recognition service
    RemoteInference,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::RemoteInference => "remote_inference",
        }
    }
}

/// Host-provided consent prompt
#[async_trait::async_trait]
pub trait ConsentGate: Send + Sync {
    /// Whether consent has already been given
    fn is_consent_granted(&self, capability: Capability) -> bool;

    /// Ask for consent; `true` when granted
    async fn request_consent(&self, capability: Capability) -> bool;
}

/// Consent answered from the `[privacy]` policy plus an optional grant for
/// the current session
pub struct PolicyConsent {
    policy: ConsentPolicy,
    session_grant: AtomicBool,
}

impl PolicyConsent {
    pub fn new(policy: ConsentPolicy) -> Self {
        Self {
            policy,
            session_grant: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &PrivacyConfig) -> Self {
        Self::new(config.remote_consent)
    }

    /// Grant consent until the process exits (ignored under `never`)
    pub fn grant_for_session(&self) {
        if self.policy == ConsentPolicy::Never {
            info!("Remote recognition is disabled by policy; session grant ignored");
            return;
        }
        self.session_grant.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.session_grant.store(false, Ordering::SeqCst);
    }

    pub fn policy(&self) -> ConsentPolicy {
        self.policy
    }
}

#[async_trait::async_trait]
impl ConsentGate for PolicyConsent {
    fn is_consent_granted(&self, _capability: Capability) -> bool {
        match self.policy {
            ConsentPolicy::Always => true,
            ConsentPolicy::Never => false,
            ConsentPolicy::Ask => self.session_grant.load(Ordering::SeqCst),
        }
    }

    async fn request_consent(&self, capability: Capability) -> bool {
        let granted = self.is_consent_granted(capability);
        if !granted {
            info!("Consent for {} not granted", capability.as_str());
        }
        granted
    }
}
