//! Backend output normalization.
//!
//! Every backend returns raw text: ideally a JSON array of elements, sometimes
//! JSON wrapped in prose or code fences, sometimes one element per line. This
//! module turns any of those into the element list the rest of the engine
//! relies on:
//! - boxes are clamped to the screenshot; boxes that end up empty are dropped
//! - confidence is clamped to 0.0-1.0, with a configured default when missing
//! - actionable elements always carry text
//! - elements are in reading order (top-to-bottom, then left-to-right) with
//!   ids `element_001`, `element_002`, ... and parents that exist

use crate::config::RecognitionConfig;
use crate::types::{
    average_confidence, placeholder_text, BoundingBox, ElementType, FailureKind,
    RecognitionStatus, UIElement,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

lazy_static! {
    // Outermost JSON array, possibly surrounded by prose or code fences
    static ref JSON_ARRAY: Regex = Regex::new(r"(?s)\[.*\]").unwrap();

    // Free-text element line: "button: Send [10, 20, 110, 60] 0.92"
    static ref ELEMENT_LINE: Regex = Regex::new(
        r"(?m)^[ \t]*(?:[-*][ \t]+|\d+[.)][ \t]+)?(?P<kind>[A-Za-z][A-Za-z _-]*?)[ \t]*:[ \t]*(?P<text>.*?)[ \t]*\[[ \t]*(?P<x1>-?\d+(?:\.\d+)?)[ \t]*,[ \t]*(?P<y1>-?\d+(?:\.\d+)?)[ \t]*,[ \t]*(?P<x2>-?\d+(?:\.\d+)?)[ \t]*,[ \t]*(?P<y2>-?\d+(?:\.\d+)?)[ \t]*\](?:[ \t]*\(?[ \t]*(?P<conf>\d*\.?\d+)[ \t]*\)?)?[ \t]*\r?$"
    ).unwrap();
}

const TYPE_KEYS: &[&str] = &["type", "element_type", "role"];
const TEXT_KEYS: &[&str] = &["text", "label", "content", "name", "description"];
const BBOX_KEYS: &[&str] = &["bbox", "box", "bounding_box"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "score"];
const ACTIONABLE_KEYS: &[&str] = &["actionable", "clickable", "interactive"];
const PARENT_KEYS: &[&str] = &["parent_id", "parentId", "parent"];

/// Normalization settings taken from `[recognition]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeOptions {
    /// Confidence assumed when the backend gives none
    pub default_confidence: f32,
    /// Average confidence below this marks a result partial
    pub partial_threshold: f32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::from_config(&RecognitionConfig::default())
    }
}

impl NormalizeOptions {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            default_confidence: config.default_confidence.clamp(0.0, 1.0),
            partial_threshold: config.partial_threshold,
        }
    }
}

/// An element as the backend described it, before validation
#[derive(Debug, Clone)]
struct RawElement {
    id: Option<String>,
    kind: String,
    text: String,
    coords: [f64; 4],
    confidence: Option<f64>,
    actionable: Option<bool>,
    parent_id: Option<String>,
}

/// Convert raw backend output into validated elements for a
/// `width` x `height` screenshot.
///
/// Output that contains no recognizable element structure at all is an
/// `InvalidResponse`; an explicit empty array is a valid empty result.
pub fn normalize_output(
    raw: &str,
    width: u32,
    height: u32,
    options: &NormalizeOptions,
) -> Result<Vec<UIElement>, FailureKind> {
    let parsed = match json_items(raw) {
        Some(items) => items.iter().filter_map(raw_from_json).collect(),
        None => parse_free_text(raw).ok_or_else(|| {
            FailureKind::InvalidResponse(format!(
                "no element list in output: {}",
                preview(raw)
            ))
        })?,
    };

    let elements = finalize(parsed, width, height, options);
    debug!("Normalized {} elements", elements.len());
    Ok(elements)
}

/// Status for a finished element list
pub fn classify_status(elements: &[UIElement], partial_threshold: f32) -> RecognitionStatus {
    if !elements.is_empty() && average_confidence(elements) < partial_threshold {
        RecognitionStatus::PartialSuccess
    } else {
        RecognitionStatus::Success
    }
}

/// Extract the JSON element array, if the output has one
fn json_items(raw: &str) -> Option<Vec<Value>> {
    let trimmed = raw.trim();

    let items = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => Some(items),
        Ok(Value::Object(mut map)) => match map.remove("elements") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    };

    let items = match items {
        Some(items) => items,
        None => {
            let found = JSON_ARRAY.find(trimmed)?;
            match serde_json::from_str::<Value>(found.as_str()).ok()? {
                Value::Array(items) => items,
                _ => return None,
            }
        }
    };

    // A bare coordinate list is not an element array
    if items.iter().all(Value::is_object) {
        Some(items)
    } else {
        None
    }
}

fn raw_from_json(item: &Value) -> Option<RawElement> {
    let obj = item.as_object()?;

    let coords = match BBOX_KEYS.iter().find_map(|k| obj.get(*k)).and_then(coords_of) {
        Some(coords) => coords,
        None => {
            warn!("Dropping element without a usable bbox: {}", preview(&item.to_string()));
            return None;
        }
    };

    Some(RawElement {
        id: obj.get("id").and_then(id_of),
        kind: first_str(obj, TYPE_KEYS).unwrap_or_else(|| "unknown".to_string()),
        text: first_str(obj, TEXT_KEYS).unwrap_or_default(),
        coords,
        confidence: CONFIDENCE_KEYS.iter().find_map(|k| obj.get(*k)?.as_f64()),
        actionable: ACTIONABLE_KEYS.iter().find_map(|k| obj.get(*k)?.as_bool()),
        parent_id: PARENT_KEYS.iter().find_map(|k| obj.get(*k)).and_then(id_of),
    })
}

fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k)?.as_str())
        .map(|s| s.to_string())
}

fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `[x1, y1, x2, y2]` or `{"x1": .., "y1": .., "x2": .., "y2": ..}`
fn coords_of(value: &Value) -> Option<[f64; 4]> {
    match value {
        Value::Array(values) if values.len() == 4 => {
            let mut coords = [0.0; 4];
            for (slot, v) in coords.iter_mut().zip(values) {
                *slot = v.as_f64()?;
            }
            Some(coords)
        }
        Value::Object(map) => Some([
            map.get("x1")?.as_f64()?,
            map.get("y1")?.as_f64()?,
            map.get("x2")?.as_f64()?,
            map.get("y2")?.as_f64()?,
        ]),
        _ => None,
    }
}

fn parse_free_text(raw: &str) -> Option<Vec<RawElement>> {
    let mut elements = Vec::new();

    for caps in ELEMENT_LINE.captures_iter(raw) {
        let coord = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<f64>().ok());
        let (Some(x1), Some(y1), Some(x2), Some(y2)) =
            (coord("x1"), coord("y1"), coord("x2"), coord("y2"))
        else {
            continue;
        };

        elements.push(RawElement {
            id: None,
            kind: caps["kind"].to_string(),
            text: caps["text"].trim().trim_matches('"').to_string(),
            coords: [x1, y1, x2, y2],
            confidence: caps.name("conf").and_then(|m| m.as_str().parse().ok()),
            actionable: None,
            parent_id: None,
        });
    }

    if elements.is_empty() {
        None
    } else {
        Some(elements)
    }
}

fn finalize(
    raw: Vec<RawElement>,
    width: u32,
    height: u32,
    options: &NormalizeOptions,
) -> Vec<UIElement> {
    let mut kept: Vec<(RawElement, UIElement)> = Vec::with_capacity(raw.len());

    for element in raw {
        let bbox = match clamp_bbox(element.coords, width, height) {
            Some(bbox) => bbox,
            None => {
                warn!(
                    "Dropping {} '{}': bbox {:?} outside {}x{} image",
                    element.kind, element.text, element.coords, width, height
                );
                continue;
            }
        };

        let confidence = match element.confidence {
            Some(c) if c.is_nan() => {
                warn!("Dropping {} '{}': confidence is NaN", element.kind, element.text);
                continue;
            }
            Some(c) => c.clamp(0.0, 1.0) as f32,
            None => options.default_confidence,
        };

        let element_type = ElementType::from_label(&element.kind);
        let actionable = element
            .actionable
            .unwrap_or_else(|| element_type.is_interactive());

        let mut text = element.text.trim().to_string();
        if actionable && text.is_empty() {
            text = placeholder_text(element_type);
        }

        let normalized = UIElement {
            id: String::new(),
            element_type,
            text,
            bbox,
            confidence,
            actionable,
            parent_id: None,
        };
        kept.push((element, normalized));
    }

    // Reading order
    kept.sort_by_key(|(_, e)| (e.bbox.y1, e.bbox.x1));

    let mut id_map: HashMap<String, String> = HashMap::new();
    for (position, (raw, element)) in kept.iter_mut().enumerate() {
        element.id = format!("element_{:03}", position + 1);
        if let Some(original) = &raw.id {
            id_map.entry(original.clone()).or_insert_with(|| element.id.clone());
        }
    }

    kept.into_iter()
        .map(|(raw, mut element)| {
            element.parent_id = raw
                .parent_id
                .as_ref()
                .and_then(|p| id_map.get(p))
                .filter(|p| **p != element.id)
                .cloned();
            element
        })
        .collect()
}

/// Clamp a box to the image; `None` when nothing of it remains
fn clamp_bbox(coords: [f64; 4], width: u32, height: u32) -> Option<BoundingBox> {
    if coords.iter().any(|c| !c.is_finite()) {
        return None;
    }

    let clamp = |v: f64, max: u32| v.round().clamp(0.0, max as f64) as u32;
    let [x1, y1, x2, y2] = coords;
    let bbox = BoundingBox::new(
        clamp(x1, width),
        clamp(y1, height),
        clamp(x2, width),
        clamp(y2, height),
    )?;

    if bbox.x1 as f64 != x1.round()
        || bbox.y1 as f64 != y1.round()
        || bbox.x2 as f64 != x2.round()
        || bbox.y2 as f64 != y2.round()
    {
        warn!("Clamped bbox {:?} to {}x{} image", coords, width, height);
    }
    Some(bbox)
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() > 80 {
        format!("{}...", trimmed.chars().take(80).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeOptions {
        NormalizeOptions::default()
    }

    #[test]
    fn test_parses_plain_json_array() {
        let raw = r#"[
            {"type":"icon_button","text":"microphone mute","bbox":[100,500,140,540],"confidence":0.92,"actionable":true},
            {"type":"text","text":"Meeting","bbox":[10,10,200,40],"confidence":0.8,"actionable":false}
        ]"#;

        let elements = normalize_output(raw, 800, 600, &opts()).unwrap();
        assert_eq!(elements.len(), 2);
        // Reading order puts the heading first
        assert_eq!(elements[0].text, "Meeting");
        assert_eq!(elements[0].id, "element_001");
        assert_eq!(elements[1].element_type, ElementType::Button);
        assert_eq!(elements[1].id, "element_002");
        assert_eq!(elements[1].bbox, BoundingBox::new(100, 500, 140, 540).unwrap());
    }

    #[test]
    fn test_parses_json_inside_prose() {
        let raw = "Here are the elements:\n```json\n[{\"type\":\"link\",\"text\":\"Help\",\"bbox\":[1,2,30,12]}]\n```";
        let elements = normalize_output(raw, 100, 100, &opts()).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].element_type, ElementType::Link);
        // Missing confidence takes the default, missing actionable follows the type
        assert_eq!(elements[0].confidence, 0.5);
        assert!(elements[0].actionable);
    }

    #[test]
    fn test_parses_elements_object() {
        let raw = r#"{"elements":[{"role":"checkbox","label":"Remember me","box":{"x1":5,"y1":5,"x2":20,"y2":20},"score":0.9}]}"#;
        let elements = normalize_output(raw, 50, 50, &opts()).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].element_type, ElementType::Checkbox);
        assert_eq!(elements[0].text, "Remember me");
    }

    #[test]
    fn test_parses_free_text_lines() {
        let raw = "Detected:\n- button: Send [10, 20, 110, 60] 0.92\n- textbox: Message [10, 70, 300, 100] (0.81)\nthat is all";
        let elements = normalize_output(raw, 400, 200, &opts()).unwrap();

        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].text, "Send");
        assert!((elements[0].confidence - 0.92).abs() < 1e-6);
        assert_eq!(elements[1].element_type, ElementType::Textbox);
    }

    #[test]
    fn test_unparseable_output_is_invalid_response() {
        let result = normalize_output("I could not see anything useful.", 100, 100, &opts());
        assert!(matches!(result, Err(FailureKind::InvalidResponse(_))));

        // A coordinate list alone is not an element array either
        let result = normalize_output("[1, 2, 3, 4]", 100, 100, &opts());
        assert!(matches!(result, Err(FailureKind::InvalidResponse(_))));
    }

    #[test]
    fn test_empty_array_is_valid() {
        assert!(normalize_output("[]", 100, 100, &opts()).unwrap().is_empty());
    }

    #[test]
    fn test_boxes_clamped_or_dropped() {
        let raw = r#"[
            {"type":"button","text":"Edge","bbox":[90,-5,130,20],"confidence":0.9},
            {"type":"button","text":"Gone","bbox":[150,150,200,200],"confidence":0.9},
            {"type":"button","text":"Flat","bbox":[10,10,10,30],"confidence":0.9},
            {"type":"button","text":"NoBox","confidence":0.9}
        ]"#;

        let elements = normalize_output(raw, 100, 100, &opts()).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text, "Edge");
        assert_eq!(elements[0].bbox, BoundingBox::new(90, 0, 100, 20).unwrap());
        assert!(elements[0].bbox.fits_within(100, 100));
    }

    #[test]
    fn test_actionable_empty_text_gets_placeholder() {
        let raw = r#"[
            {"type":"icon","text":"","bbox":[0,0,10,10],"actionable":true},
            {"type":"image","text":"  ","bbox":[0,20,10,30],"actionable":false}
        ]"#;

        let elements = normalize_output(raw, 50, 50, &opts()).unwrap();
        assert_eq!(elements[0].text, "unrecognized icon");
        // Non-actionable elements may stay empty
        assert_eq!(elements[1].text, "");
    }

    #[test]
    fn test_confidence_clamped() {
        let raw = r#"[
            {"type":"text","text":"a","bbox":[0,0,10,10],"confidence":1.7},
            {"type":"text","text":"b","bbox":[0,20,10,30],"confidence":-0.2}
        ]"#;
        let elements = normalize_output(raw, 50, 50, &opts()).unwrap();
        assert_eq!(elements[0].confidence, 1.0);
        assert_eq!(elements[1].confidence, 0.0);
    }

    #[test]
    fn test_parent_ids_remapped_or_dropped() {
        let raw = r#"[
            {"id":"btn","type":"button","text":"OK","bbox":[20,20,40,30],"parent_id":"dlg"},
            {"id":"dlg","type":"dialog","text":"Confirm","bbox":[0,0,100,100]},
            {"id":"x","type":"button","text":"Cancel","bbox":[50,20,70,30],"parent_id":"missing"}
        ]"#;

        let elements = normalize_output(raw, 100, 100, &opts()).unwrap();
        assert_eq!(elements[0].text, "Confirm");
        assert_eq!(elements[0].element_type, ElementType::Container);
        assert_eq!(elements[1].parent_id.as_deref(), Some("element_001"));
        assert_eq!(elements[2].parent_id, None);
    }

    #[test]
    fn test_classify_status() {
        let raw = r#"[
            {"type":"text","text":"a","bbox":[0,0,10,10],"confidence":0.6},
            {"type":"text","text":"b","bbox":[0,20,10,30],"confidence":0.7}
        ]"#;
        let elements = normalize_output(raw, 50, 50, &opts()).unwrap();

        assert_eq!(classify_status(&elements, 0.7), RecognitionStatus::PartialSuccess);
        assert_eq!(classify_status(&elements, 0.6), RecognitionStatus::Success);
        assert_eq!(classify_status(&[], 0.7), RecognitionStatus::Success);
    }
}
