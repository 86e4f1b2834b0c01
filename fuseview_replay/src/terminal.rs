//! Operator keystrokes from the controlling terminal.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use fuseview_env::{Command, CommandSource, EnvError};
use tracing::debug;

/// Raw mode for the duration of one key read.
///
/// Dropped before the cycle's log lines are printed so they keep normal
/// line endings.
struct RawMode;

impl RawMode {
    fn enable() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Blocking single-key command source.
#[derive(Debug, Default)]
pub struct TerminalCommands;

impl TerminalCommands {
    pub fn new() -> Self {
        Self
    }
}

/// Maps a terminal key event; `None` for events that are not a keystroke.
pub fn map_key(key: KeyEvent) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        // Raw mode swallows SIGINT
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Command::Quit),
        KeyCode::Char(c) => Some(Command::from_key(c)),
        KeyCode::Modifier(_) => None,
        _ => Some(Command::Advance),
    }
}

impl CommandSource for TerminalCommands {
    fn next_command(&mut self) -> Result<Command, EnvError> {
        let _raw = RawMode::enable().map_err(EnvError::input)?;
        loop {
            if let Event::Key(key) = event::read().map_err(EnvError::input)? {
                if let Some(command) = map_key(key) {
                    debug!(code = ?key.code, ?command, "key");
                    return Ok(command);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::ModifierKeyCode;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_key_bindings() {
        assert_eq!(map_key(press(KeyCode::Char(','))), Some(Command::Rewind));
        assert_eq!(map_key(press(KeyCode::Char('q'))), Some(Command::Quit));
        assert_eq!(map_key(press(KeyCode::Char(' '))), Some(Command::Advance));
        assert_eq!(map_key(press(KeyCode::Enter)), Some(Command::Advance));
    }

    #[test]
    fn test_ctrl_c_quits() {
        let key = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key(key), Some(Command::Quit));
        assert_eq!(map_key(press(KeyCode::Char('c'))), Some(Command::Advance));
    }

    #[test]
    fn test_release_and_modifier_events_ignored() {
        let release =
            KeyEvent::new_with_kind(KeyCode::Char(','), KeyModifiers::NONE, KeyEventKind::Release);
        assert_eq!(map_key(release), None);
        assert_eq!(map_key(press(KeyCode::Modifier(ModifierKeyCode::LeftShift))), None);
    }
}
