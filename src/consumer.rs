//! Consumer side of the engine.
//!
//! A `ConsumerSession` runs on the consumer's thread. It drains recognition
//! events from the handoff queue, keeps the navigation state in step with the
//! latest result and turns everything into short announcements for the
//! user. Speech output itself belongs to the host behind `AnnounceSink`.

use crate::describe::{describe_element, summarize};
use crate::handoff::{ConsumerQueue, RecognitionEvent};
use crate::navigation::{Move, NavigationError, NavigationState};
use crate::types::RecognitionError;
use tracing::debug;

/// Where announcements go (speech, braille, console)
pub trait AnnounceSink: Send {
    fn announce(&mut self, text: &str);
}

/// Sink that collects announcements, for hosts that batch output
impl AnnounceSink for Vec<String> {
    fn announce(&mut self, text: &str) {
        self.push(text.to_string());
    }
}

pub struct ConsumerSession<S: AnnounceSink> {
    queue: ConsumerQueue,
    navigation: NavigationState,
    sink: S,
}

impl<S: AnnounceSink> ConsumerSession<S> {
    pub fn new(queue: ConsumerQueue, navigation: NavigationState, sink: S) -> Self {
        Self {
            queue,
            navigation,
            sink,
        }
    }

    pub fn navigation(&self) -> &NavigationState {
        &self.navigation
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Handle every queued event without waiting; returns how many
    pub fn pump(&mut self) -> usize {
        let events = self.queue.try_drain();
        let count = events.len();
        for event in events {
            self.handle(event);
        }
        count
    }

    /// Wait until the next recognition outcome has been handled. Returns
    /// `None` if the engine side is gone.
    pub async fn wait_outcome(&mut self) -> Option<Result<(), RecognitionError>> {
        while let Some(event) = self.queue.recv().await {
            let outcome = match &event {
                RecognitionEvent::Progress { .. } => None,
                RecognitionEvent::Completed(_) => Some(Ok(())),
                RecognitionEvent::Failed(e) => Some(Err(e.clone())),
            };
            self.handle(event);
            if outcome.is_some() {
                return outcome;
            }
        }
        None
    }

    pub fn handle(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Progress { elapsed } => {
                debug!("Progress after {:?}", elapsed);
                self.sink.announce("Still recognizing, please wait");
            }
            RecognitionEvent::Completed(result) => {
                let summary = summarize(&result);
                self.navigation.load(result.elements);
                self.sink.announce(&summary);
            }
            RecognitionEvent::Failed(error) => {
                debug!("Recognition failed: {}", error);
                self.sink.announce(error.user_message());
            }
        }
    }

    /// Report a rejected submission
    pub fn rejected(&mut self, error: &RecognitionError) {
        self.sink.announce(error.user_message());
    }

    pub fn next(&mut self) {
        let threshold = self.navigation.activation_threshold();
        let text = match self.navigation.next() {
            Move::Moved(element) => describe_element(element, threshold),
            Move::AtEnd(_) => "No more elements".to_string(),
            Move::AtStart(_) | Move::Empty => "No elements".to_string(),
        };
        self.sink.announce(&text);
    }

    pub fn previous(&mut self) {
        let threshold = self.navigation.activation_threshold();
        let text = match self.navigation.previous() {
            Move::Moved(element) => describe_element(element, threshold),
            Move::AtStart(_) => "No previous elements".to_string(),
            Move::AtEnd(_) | Move::Empty => "No elements".to_string(),
        };
        self.sink.announce(&text);
    }

    pub fn current(&mut self) {
        let threshold = self.navigation.activation_threshold();
        let text = match self.navigation.current() {
            Some(element) => describe_element(element, threshold),
            None => "No element selected".to_string(),
        };
        self.sink.announce(&text);
    }

    /// Activation point for the current element, if it may be clicked
    /// without confirmation
    pub fn activate(&mut self) -> Option<(u32, u32)> {
        let outcome = self.navigation.activate();
        self.announce_activation(outcome)
    }

    /// Activation point after the user confirmed a low-confidence element
    pub fn force_activate(&mut self) -> Option<(u32, u32)> {
        let outcome = self.navigation.force_activate();
        self.announce_activation(outcome)
    }

    fn announce_activation(
        &mut self,
        outcome: Result<(u32, u32), NavigationError>,
    ) -> Option<(u32, u32)> {
        match outcome {
            Ok(point) => {
                let name = self
                    .navigation
                    .current()
                    .map(|e| e.description())
                    .unwrap_or_default();
                self.sink.announce(&format!("Activating {}", name));
                Some(point)
            }
            Err(NavigationError::NeedsConfirmation {
                description,
                center,
                confidence,
            }) => {
                self.sink.announce(&format!(
                    "Low confidence {:.0}% for {} at {}, {}. Confirm to activate",
                    confidence * 100.0,
                    description,
                    center.0,
                    center.1
                ));
                None
            }
            Err(NavigationError::NotActionable(description)) => {
                self.sink.announce(&format!("{} is not actionable", description));
                None
            }
            Err(NavigationError::NoCurrentElement) => {
                self.sink.announce("No element selected");
                None
            }
        }
    }
}
