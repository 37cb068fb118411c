//! Element navigation and activation.
//!
//! Holds one result's elements in reading order with a cursor. The cursor
//! starts before the first element; `next` and `previous` stop at the ends
//! instead of wrapping. Loading a new result replaces the list wholesale.

use crate::types::UIElement;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavigationError {
    #[error("No element selected")]
    NoCurrentElement,

    #[error("Element '{0}' cannot be activated")]
    NotActionable(String),

    /// Confidence is below the activation threshold; confirm with
    /// `force_activate`
    #[error("Low confidence ({confidence:.2}) for '{description}', confirmation needed")]
    NeedsConfirmation {
        description: String,
        center: (u32, u32),
        confidence: f32,
    },
}

/// Outcome of a cursor move
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Move<'a> {
    Moved(&'a UIElement),
    /// Already on the last element; cursor unchanged
    AtEnd(&'a UIElement),
    /// Already on the first element; cursor unchanged
    AtStart(&'a UIElement),
    /// Nothing loaded, or the result had no elements
    Empty,
}

/// Cursor over one result's elements
#[derive(Debug, Clone)]
pub struct NavigationState {
    elements: Option<Arc<[UIElement]>>,
    index: Option<usize>,
    activation_threshold: f32,
}

impl NavigationState {
    pub fn new(activation_threshold: f32) -> Self {
        Self {
            elements: None,
            index: None,
            activation_threshold,
        }
    }

    /// Replace the element list and put the cursor before the first element
    pub fn load(&mut self, elements: impl Into<Arc<[UIElement]>>) {
        let elements = elements.into();
        debug!("Navigation loaded {} elements", elements.len());
        self.elements = Some(elements);
        self.index = None;
    }

    pub fn reset(&mut self) {
        self.elements = None;
        self.index = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.elements.is_some()
    }

    pub fn len(&self) -> usize {
        self.elements.as_ref().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor position, `None` before the first move
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn activation_threshold(&self) -> f32 {
        self.activation_threshold
    }

    pub fn next(&mut self) -> Move<'_> {
        let Some(elements) = self.elements.as_deref().filter(|e| !e.is_empty()) else {
            return Move::Empty;
        };

        let last = elements.len() - 1;
        match self.index {
            Some(i) if i >= last => Move::AtEnd(&elements[last]),
            Some(i) => {
                self.index = Some(i + 1);
                Move::Moved(&elements[i + 1])
            }
            None => {
                self.index = Some(0);
                Move::Moved(&elements[0])
            }
        }
    }

    pub fn previous(&mut self) -> Move<'_> {
        let Some(elements) = self.elements.as_deref().filter(|e| !e.is_empty()) else {
            return Move::Empty;
        };

        match self.index {
            Some(0) => Move::AtStart(&elements[0]),
            Some(i) => {
                self.index = Some(i - 1);
                Move::Moved(&elements[i - 1])
            }
            // Clamped to the first element
            None => {
                self.index = Some(0);
                Move::Moved(&elements[0])
            }
        }
    }

    pub fn current(&self) -> Option<&UIElement> {
        let elements = self.elements.as_deref()?;
        elements.get(self.index?)
    }

    /// Screen point to click for the current element
    pub fn activate(&self) -> Result<(u32, u32), NavigationError> {
        let element = self.actionable_current()?;

        if element.is_uncertain(self.activation_threshold) {
            return Err(NavigationError::NeedsConfirmation {
                description: element.description(),
                center: element.center(),
                confidence: element.confidence,
            });
        }
        Ok(element.center())
    }

    /// Like `activate`, without the confidence check
    pub fn force_activate(&self) -> Result<(u32, u32), NavigationError> {
        Ok(self.actionable_current()?.center())
    }

    fn actionable_current(&self) -> Result<&UIElement, NavigationError> {
        let element = self.current().ok_or(NavigationError::NoCurrentElement)?;
        if !element.actionable {
            return Err(NavigationError::NotActionable(element.description()));
        }
        Ok(element)
    }
}
