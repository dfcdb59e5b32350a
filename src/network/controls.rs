// Control input reduction
// Turns press/release edges on the two steering buttons into a Direction,
// and gates forwarding on "channel open" AND "lobby started"

use serde::{Deserialize, Serialize};

use super::protocol::Direction;

/// A steering button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    Left,
    Right,
}

/// Press/release state of both buttons, reduced to a Direction.
///
/// | left | right | direction |
/// |------|-------|-----------|
/// | no   | no    | FORWARD   |
/// | yes  | no    | LEFT      |
/// | no   | yes   | RIGHT     |
/// | yes  | yes   | FORWARD   |
///
/// With nothing pressed yet the committed direction is FORWARD.
#[derive(Debug, Clone)]
pub struct DirectionReducer {
    left_pressed: bool,
    right_pressed: bool,
    current: Direction,
}

impl Default for DirectionReducer {
    fn default() -> Self {
        Self {
            left_pressed: false,
            right_pressed: false,
            current: Direction::Forward,
        }
    }
}

impl DirectionReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reduce(left_pressed: bool, right_pressed: bool) -> Direction {
        match (left_pressed, right_pressed) {
            (true, false) => Direction::Left,
            (false, true) => Direction::Right,
            (true, true) | (false, false) => Direction::Forward,
        }
    }

    pub fn current(&self) -> Direction {
        self.current
    }

    /// Apply an edge; returns the new direction if it changed
    pub fn set(&mut self, control: Control, pressed: bool) -> Option<Direction> {
        match control {
            Control::Left => self.left_pressed = pressed,
            Control::Right => self.right_pressed = pressed,
        }
        let next = Self::reduce(self.left_pressed, self.right_pressed);
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }

    /// Release both buttons and fall back to FORWARD
    pub fn reset(&mut self) {
        self.left_pressed = false;
        self.right_pressed = false;
        self.current = Direction::Forward;
    }
}

/// Sends happen only while both conditions hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputGate {
    pub channel_open: bool,
    pub lobby_started: bool,
}

impl InputGate {
    pub fn is_open(&self) -> bool {
        self.channel_open && self.lobby_started
    }
}

/// Delivery policy for directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Send once per direction change
    OnChange,
    /// Resend the latest direction on every tick while forwarding
    Retransmit { interval_ms: u64 },
}
