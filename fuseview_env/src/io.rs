//! Frame sinks and operator command sources.

use crate::error::EnvError;
use crate::frame::RenderFrame;
use std::collections::VecDeque;

/// One operator decision, read once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Commit the current frame and move to the next record
    Advance,
    /// Step back one frame (acts as `Advance` with empty history)
    Rewind,
    /// End the session
    Quit,
}

impl Command {
    /// Maps a keystroke: `,` rewinds, `q` quits, anything else advances.
    pub fn from_key(key: char) -> Self {
        match key {
            ',' => Command::Rewind,
            'q' => Command::Quit,
            _ => Command::Advance,
        }
    }
}

/// Destination for composited frames (video encoder, window, snapshot file).
///
/// # Lifecycle
///
/// `push` is called once per displayed cycle. `finish` is called exactly
/// once when the session ends, on every exit path.
pub trait FrameSink {
    /// Accepts one composited frame.
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError>;

    /// Flushes and releases the underlying resource.
    fn finish(&mut self) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Blocking source of operator commands.
pub trait CommandSource {
    /// Waits for the next command.
    fn next_command(&mut self) -> Result<Command, EnvError>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn push(&mut self, frame: &RenderFrame) -> Result<(), EnvError> {
        (**self).push(frame)
    }

    fn finish(&mut self) -> Result<(), EnvError> {
        (**self).finish()
    }
}

impl<C: CommandSource + ?Sized> CommandSource for Box<C> {
    fn next_command(&mut self) -> Result<Command, EnvError> {
        (**self).next_command()
    }
}

/// Replays a fixed command script, then repeats `fallback` forever.
///
/// Used for unattended (`--batch`) runs and tests.
#[derive(Debug, Clone)]
pub struct ScriptedCommands {
    script: VecDeque<Command>,
    fallback: Command,
}

impl ScriptedCommands {
    pub fn new(script: impl IntoIterator<Item = Command>, fallback: Command) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
        }
    }

    /// Advances through every record until the stream ends.
    pub fn advance_forever() -> Self {
        Self::new([], Command::Advance)
    }

    /// Parses a key string such as `"..,.q"` with [`Command::from_key`].
    pub fn from_keys(keys: &str, fallback: Command) -> Self {
        Self::new(keys.chars().map(Command::from_key), fallback)
    }
}

impl CommandSource for ScriptedCommands {
    fn next_command(&mut self) -> Result<Command, EnvError> {
        Ok(self.script.pop_front().unwrap_or(self.fallback))
    }
}
