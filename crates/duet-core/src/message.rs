//! Message exchanged between players

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable message carrying text and the sender's sequence counter
///
/// Counters start at 1 for the first message a player sends and grow by one
/// per send. Fields are private so a message cannot change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    content: String,
    counter: i32,
}

impl Message {
    /// Create a new message
    pub fn new(content: impl Into<String>, counter: i32) -> Self {
        Self {
            content: content.into(),
            counter,
        }
    }

    /// Text content
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Sender-assigned sequence counter
    pub fn counter(&self) -> i32 {
        self.counter
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{content='{}', counter={}}}",
            self.content, self.counter
        )
    }
}
