//! Press-to-release timing for a single pointer gesture.
//!
//! One `GestureTimer` is created per capture attempt and owned by the
//! `Capturing` state, so press timestamps never leak across sessions.

use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct GestureTimer {
    pressed_at: Option<Instant>,
}

impl GestureTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the press timestamp.
    pub fn on_press(&mut self) {
        self.pressed_at = Some(Instant::now());
    }

    /// Elapsed milliseconds since the press, or 0 if no press was recorded.
    pub fn on_release(&mut self) -> u64 {
        match self.pressed_at.take() {
            Some(pressed_at) => pressed_at.elapsed().as_millis() as u64,
            None => 0,
        }
    }
}
