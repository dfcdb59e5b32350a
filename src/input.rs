// Keyboard handling for the terminal controller
// Maps configured keys to steering edges on the two controls

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::io;
use std::time::Duration;

use crate::config::KeyBindings;
use crate::network::Control;

/// What the front end should do with a key event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    Press(Control),
    Release(Control),
    Quit,
}

/// Parse a binding name like "Left", "Space" or "A"
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let code = match name.trim().to_ascii_lowercase().as_str() {
        "left" => KeyCode::Left,
        "right" => KeyCode::Right,
        "up" => KeyCode::Up,
        "down" => KeyCode::Down,
        "space" => KeyCode::Char(' '),
        "enter" => KeyCode::Enter,
        "esc" | "escape" => KeyCode::Esc,
        "tab" => KeyCode::Tab,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => KeyCode::Char(c),
                _ => return None,
            }
        }
    };
    Some(code)
}

/// Resolved key bindings
#[derive(Debug, Clone)]
pub struct KeyMap {
    left: KeyCode,
    right: KeyCode,
    quit: KeyCode,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            left: KeyCode::Left,
            right: KeyCode::Right,
            quit: KeyCode::Char('q'),
        }
    }
}

impl KeyMap {
    /// Unknown names fall back to the default key for that slot
    pub fn from_bindings(bindings: &KeyBindings) -> Self {
        let defaults = Self::default();
        Self {
            left: parse_key(&bindings.left).unwrap_or(defaults.left),
            right: parse_key(&bindings.right).unwrap_or(defaults.right),
            quit: parse_key(&bindings.quit).unwrap_or(defaults.quit),
        }
    }

    fn control(&self, code: KeyCode) -> Option<Control> {
        let code = normalize(code);
        if code == normalize(self.left) {
            Some(Control::Left)
        } else if code == normalize(self.right) {
            Some(Control::Right)
        } else {
            None
        }
    }

    /// Translate one key event.
    ///
    /// With `reports_release` the terminal delivers real release events.
    /// Without it a press on one side releases the other, and Space/Down
    /// releases both.
    pub fn map_key(&self, key: KeyEvent, reports_release: bool) -> Vec<InputAction> {
        let quit = normalize(key.code) == normalize(self.quit)
            || key.code == KeyCode::Esc
            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
        if quit && key.kind == KeyEventKind::Press {
            return vec![InputAction::Quit];
        }

        match (self.control(key.code), key.kind) {
            (Some(control), KeyEventKind::Press) if reports_release => {
                vec![InputAction::Press(control)]
            }
            (Some(control), KeyEventKind::Release) => vec![InputAction::Release(control)],
            (Some(_), KeyEventKind::Repeat) => Vec::new(),
            (Some(control), KeyEventKind::Press) => {
                vec![InputAction::Release(other(control)), InputAction::Press(control)]
            }
            (None, KeyEventKind::Press)
                if !reports_release && matches!(key.code, KeyCode::Char(' ') | KeyCode::Down) =>
            {
                vec![
                    InputAction::Release(Control::Left),
                    InputAction::Release(Control::Right),
                ]
            }
            _ => Vec::new(),
        }
    }
}

/// Drain all pending key events
pub fn poll_input(keymap: &KeyMap, timeout: Duration, reports_release: bool) -> io::Result<Vec<InputAction>> {
    let mut actions = Vec::new();
    let mut wait = timeout;

    while event::poll(wait)? {
        if let Event::Key(key) = event::read()? {
            actions.extend(keymap.map_key(key, reports_release));
        }
        wait = Duration::from_millis(0);
    }

    Ok(actions)
}

fn other(control: Control) -> Control {
    match control {
        Control::Left => Control::Right,
        Control::Right => Control::Left,
    }
}

fn normalize(code: KeyCode) -> KeyCode {
    match code {
        KeyCode::Char(c) => KeyCode::Char(c.to_ascii_lowercase()),
        other => other,
    }
}
