//! Spoken descriptions of elements and results.

use crate::types::{RecognitionResult, RecognitionStatus, UIElement};

/// "button: Send (uncertain) at 120, 40"
pub fn describe_element(element: &UIElement, uncertain_below: f32) -> String {
    let (x, y) = element.center();
    let mut text = format!("{}: {}", element.element_type.as_str(), element.description());
    if element.is_uncertain(uncertain_below) {
        text.push_str(" (uncertain)");
    }
    text.push_str(&format!(" at {}, {}", x, y));
    text
}

/// One-line announcement for a finished recognition
pub fn summarize(result: &RecognitionResult) -> String {
    if result.elements.is_empty() {
        return format!("No elements found {}", result.backend_used.spoken());
    }

    let count = result.element_count();
    let mut text = format!(
        "Found {} element{}, {} actionable, average confidence {:.0}%, {}",
        count,
        if count == 1 { "" } else { "s" },
        result.actionable_count(),
        result.average_confidence() * 100.0,
        result.backend_used.spoken()
    );

    if result.from_cache {
        text.push_str(" (cached)");
    }
    if result.status == RecognitionStatus::PartialSuccess {
        text.push_str(". Results may be incomplete");
    }
    text
}
