//! Relocate value objects

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Relocation state
///
/// The set is closed: `Starting` is initial, the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocateState {
    /// Registered, destination not dialed yet
    Starting,
    /// Destination leg originated and alerting
    Ringing,
    /// Destination answered, waiting for completion
    Answered,
    Completed,
    Cancelled,
    TimedOut,
    Ended,
}

impl RelocateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelocateState::Starting => "starting",
            RelocateState::Ringing => "ringing",
            RelocateState::Answered => "answered",
            RelocateState::Completed => "completed",
            RelocateState::Cancelled => "cancelled",
            RelocateState::TimedOut => "timed_out",
            RelocateState::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelocateState::Completed
                | RelocateState::Cancelled
                | RelocateState::TimedOut
                | RelocateState::Ended
        )
    }

    /// Whether a pending timeout still applies in this state
    pub fn accepts_timeout(&self) -> bool {
        matches!(self, RelocateState::Starting | RelocateState::Ringing)
    }
}

impl fmt::Display for RelocateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger that finalizes a relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// Complete as soon as the destination answers
    Answer,
    /// Complete when the API asks for it
    Api,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Answer => "answer",
            Completion::Api => "api",
        }
    }
}

impl FromStr for Completion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "answer" => Ok(Completion::Answer),
            "api" => Ok(Completion::Api),
            other => Err(format!("unknown completion: {}", other)),
        }
    }
}

/// Part a channel plays in a relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelocateRole {
    /// Leg of the user asking for the relocation
    Initiator,
    /// Remote party being moved
    Relocated,
    /// New leg toward the destination
    Recipient,
}
