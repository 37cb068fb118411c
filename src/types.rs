//! Core types used throughout the recognition pipeline.
//!
//! This module defines the element model produced by the backends, the
//! recognition result that flows through the cache and the orchestrator, and
//! the failure taxonomy shared between them.

use crate::fingerprint::ContentFingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of UI element recognized in a screenshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Button,
    Textbox,
    Link,
    Checkbox,
    Radio,
    Dropdown,
    Text,
    Label,
    Icon,
    Image,
    Container,
    Unknown,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Button => "button",
            ElementType::Textbox => "textbox",
            ElementType::Link => "link",
            ElementType::Checkbox => "checkbox",
            ElementType::Radio => "radio",
            ElementType::Dropdown => "dropdown",
            ElementType::Text => "text",
            ElementType::Label => "label",
            ElementType::Icon => "icon",
            ElementType::Image => "image",
            ElementType::Container => "container",
            ElementType::Unknown => "unknown",
        }
    }

    /// Parse the canonical name as written by `as_str`
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "button" => ElementType::Button,
            "textbox" => ElementType::Textbox,
            "link" => ElementType::Link,
            "checkbox" => ElementType::Checkbox,
            "radio" => ElementType::Radio,
            "dropdown" => ElementType::Dropdown,
            "text" => ElementType::Text,
            "label" => ElementType::Label,
            "icon" => ElementType::Icon,
            "image" => ElementType::Image,
            "container" => ElementType::Container,
            "unknown" => ElementType::Unknown,
            _ => return None,
        };
        Some(kind)
    }

    /// Map a free-form backend label onto an element type.
    ///
    /// Backends disagree on naming ("icon_button", "input", "combobox", ...),
    /// so anything not recognized becomes `Unknown` rather than an error.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        if let Some(kind) = Self::parse(&normalized) {
            return kind;
        }

        match normalized.as_str() {
            "icon_button" | "btn" | "menu_item" | "menuitem" | "tab" | "toggle" => {
                ElementType::Button
            }
            "input" | "text_field" | "textfield" | "edit" | "search" | "search_box"
            | "text_box" | "textarea" => ElementType::Textbox,
            "hyperlink" | "anchor" => ElementType::Link,
            "check_box" | "switch" => ElementType::Checkbox,
            "radio_button" | "radiobutton" => ElementType::Radio,
            "combobox" | "combo_box" | "select" | "menu" | "drop_down" => ElementType::Dropdown,
            "heading" | "paragraph" | "static_text" => ElementType::Text,
            "title" | "caption" => ElementType::Label,
            "picture" | "img" | "graphic" => ElementType::Image,
            "group" | "panel" | "pane" | "window" | "dialog" | "toolbar" | "list" => {
                ElementType::Container
            }
            _ => ElementType::Unknown,
        }
    }

    /// Whether elements of this type are interactive when the backend does
    /// not say either way
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            ElementType::Button
                | ElementType::Textbox
                | ElementType::Link
                | ElementType::Checkbox
                | ElementType::Radio
                | ElementType::Dropdown
        )
    }
}

/// Element bounds in screenshot pixel coordinates, `x1 < x2` and `y1 < y2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Build a box, rejecting degenerate or inverted coordinates
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Option<Self> {
        if x1 < x2 && y1 < y2 {
            Some(Self { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    /// Centre point, used as the activation target
    pub fn center(&self) -> (u32, u32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// Check the box lies inside a `width` x `height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x2 <= width && self.y2 <= height
    }
}

/// A UI element detected in a screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UIElement {
    /// Identifier unique within one result (e.g. "element_001")
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    /// Visible text or inferred description; never empty when actionable
    pub text: String,
    pub bbox: BoundingBox,
    /// Backend confidence, 0.0-1.0
    pub confidence: f32,
    pub actionable: bool,
    /// Id of the containing element in the same result
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl UIElement {
    pub fn center(&self) -> (u32, u32) {
        self.bbox.center()
    }

    /// Whether the confidence falls below the given threshold
    pub fn is_uncertain(&self, threshold: f32) -> bool {
        self.confidence < threshold
    }

    /// Text to present for this element, never empty
    pub fn description(&self) -> String {
        if self.text.trim().is_empty() {
            placeholder_text(self.element_type)
        } else {
            self.text.clone()
        }
    }
}

/// Placeholder for elements the backend could not label
pub fn placeholder_text(element_type: ElementType) -> String {
    format!("unrecognized {}", element_type.as_str())
}

/// Which backend produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local model on a hardware accelerator
    AcceleratedLocal,
    /// Local model on the CPU
    CpuLocal,
    /// Remote recognition API
    RemoteApi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::AcceleratedLocal => "accelerated_local",
            BackendKind::CpuLocal => "cpu_local",
            BackendKind::RemoteApi => "remote_api",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "accelerated_local" => Some(BackendKind::AcceleratedLocal),
            "cpu_local" => Some(BackendKind::CpuLocal),
            "remote_api" => Some(BackendKind::RemoteApi),
            _ => None,
        }
    }

    /// Short spoken form ("on GPU", "via remote API")
    pub fn spoken(&self) -> &'static str {
        match self {
            BackendKind::AcceleratedLocal => "on GPU",
            BackendKind::CpuLocal => "on CPU",
            BackendKind::RemoteApi => "via remote API",
        }
    }

    /// Whether this backend sends screen content off the device
    pub fn requires_consent(&self) -> bool {
        matches!(self, BackendKind::RemoteApi)
    }
}

/// Overall status of a recognition result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    Success,
    /// Average confidence below the configured threshold
    PartialSuccess,
    Failure,
    Timeout,
}

impl RecognitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionStatus::Success => "success",
            RecognitionStatus::PartialSuccess => "partial_success",
            RecognitionStatus::Failure => "failure",
            RecognitionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "success" => Some(RecognitionStatus::Success),
            "partial_success" => Some(RecognitionStatus::PartialSuccess),
            "failure" => Some(RecognitionStatus::Failure),
            "timeout" => Some(RecognitionStatus::Timeout),
            _ => None,
        }
    }
}

/// Result of recognizing one screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub fingerprint: ContentFingerprint,
    /// Elements in reading order
    pub elements: Vec<UIElement>,
    pub backend_used: BackendKind,
    /// Name of the model or service behind the backend
    pub model_name: String,
    pub latency_ms: u64,
    pub status: RecognitionStatus,
    pub created_at: DateTime<Utc>,
    /// Always `created_at + TTL`
    pub expires_at: DateTime<Utc>,
    /// Set when the result was served from the cache
    #[serde(default)]
    pub from_cache: bool,
}

impl RecognitionResult {
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn actionable_count(&self) -> usize {
        self.elements.iter().filter(|e| e.actionable).count()
    }

    /// Mean element confidence, 0.0 for an empty result
    pub fn average_confidence(&self) -> f32 {
        average_confidence(&self.elements)
    }
}

/// Mean confidence over a list of elements, 0.0 when empty
pub fn average_confidence(elements: &[UIElement]) -> f32 {
    if elements.is_empty() {
        return 0.0;
    }
    elements.iter().map(|e| e.confidence).sum::<f32>() / elements.len() as f32
}

/// Why a single backend attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend timed out")]
    Timeout,

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("Transient backend error: {0}")]
    TransientError(String),
}

/// Errors surfaced by the orchestrator to its consumer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    #[error("Recognition already in progress")]
    Busy,

    #[error("Recognition cancelled")]
    Cancelled,

    #[error("All recognition backends failed: {last}")]
    AllBackendsFailed { last: FailureKind },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecognitionError {
    /// One-line message suitable for announcing to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            RecognitionError::Busy => "Recognition already in progress",
            RecognitionError::Cancelled => "Recognition cancelled",
            RecognitionError::AllBackendsFailed { .. } => {
                "Recognition failed. No backend could read the screen."
            }
            RecognitionError::Internal(_) => "Recognition failed. Check logs for details.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(confidence: f32, actionable: bool) -> UIElement {
        UIElement {
            id: "element_001".to_string(),
            element_type: ElementType::Button,
            text: "OK".to_string(),
            bbox: BoundingBox::new(10, 20, 30, 40).unwrap(),
            confidence,
            actionable,
            parent_id: None,
        }
    }

    #[test]
    fn test_bounding_box_rejects_inverted() {
        assert!(BoundingBox::new(10, 10, 10, 20).is_none());
        assert!(BoundingBox::new(10, 30, 20, 20).is_none());
        assert!(BoundingBox::new(0, 0, 1, 1).is_some());
    }

    #[test]
    fn test_bounding_box_center() {
        let bbox = BoundingBox::new(100, 200, 301, 400).unwrap();
        assert_eq!(bbox.center(), (200, 300));
        assert_eq!(bbox.width(), 201);
        assert!(bbox.fits_within(301, 400));
        assert!(!bbox.fits_within(300, 400));
    }

    #[test]
    fn test_element_type_round_trip() {
        for kind in [
            ElementType::Button,
            ElementType::Textbox,
            ElementType::Dropdown,
            ElementType::Container,
            ElementType::Unknown,
        ] {
            assert_eq!(ElementType::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_element_type_from_backend_labels() {
        assert_eq!(ElementType::from_label("icon_button"), ElementType::Button);
        assert_eq!(ElementType::from_label("Text Field"), ElementType::Textbox);
        assert_eq!(ElementType::from_label("combobox"), ElementType::Dropdown);
        assert_eq!(ElementType::from_label("radio-button"), ElementType::Radio);
        assert_eq!(ElementType::from_label("sparkle"), ElementType::Unknown);
    }

    #[test]
    fn test_description_never_empty() {
        let mut e = element(0.9, true);
        e.text = "   ".to_string();
        assert_eq!(e.description(), "unrecognized button");
    }

    #[test]
    fn test_average_confidence() {
        assert_eq!(average_confidence(&[]), 0.0);
        let avg = average_confidence(&[element(0.5, true), element(1.0, false)]);
        assert!((avg - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_only_remote_requires_consent() {
        assert!(BackendKind::RemoteApi.requires_consent());
        assert!(!BackendKind::AcceleratedLocal.requires_consent());
        assert!(!BackendKind::CpuLocal.requires_consent());
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            RecognitionStatus::parse(RecognitionStatus::PartialSuccess.as_str()),
            Some(RecognitionStatus::PartialSuccess)
        );
        assert!(RecognitionStatus::parse("SUCCESS").is_none());
    }
}
