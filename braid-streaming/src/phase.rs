//! Lifecycle phase shared by the stream primitives.

use std::fmt;

/// Lifecycle phase of a stitched or multiplexed stream.
///
/// Phases only move forward: `Open -> Draining -> Completed | Errored`.
/// `Open` may also jump straight to a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamPhase {
    /// Accepting new inputs or consumers.
    Open,
    /// No more inputs; delivering what remains.
    Draining,
    /// Finished normally.
    Completed,
    /// Finished with an error.
    Errored,
}

impl StreamPhase {
    /// Check if the phase is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// Move to `next` unless that would go backwards or leave a terminal phase.
    ///
    /// Returns `true` if the phase changed.
    pub fn advance(&mut self, next: StreamPhase) -> bool {
        if self.is_terminal() || next <= *self {
            return false;
        }
        *self = next;
        true
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}
