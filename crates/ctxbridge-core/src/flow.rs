//! Pull-based stream flow control.
//!
//! Both ends of a stream run the same state machine:
//!
//! ```text
//! Opening --open--> Idle --write--> DataInFlight --pull--> Idle
//!    \                 \                  \
//!     `------------------`------close------`--> Closed
//! ```
//!
//! At most one `stream-data` may be outstanding without a `stream-pull`. The
//! service side uses the machine to gate handler writes; the client side uses
//! it to reject a peer that sends a second item before being pulled.

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Idle,
    DataInFlight,
    Closed { ok: bool },
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Opening => "opening",
            StreamState::Idle => "idle",
            StreamState::DataInFlight => "data-in-flight",
            StreamState::Closed { ok: true } => "closed-ok",
            StreamState::Closed { ok: false } => "closed-error",
        }
    }
}

#[derive(Debug)]
pub struct StreamMachine {
    state: StreamState,
    items: u64,
}

impl Default for StreamMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMachine {
    pub fn new() -> Self {
        Self {
            state: StreamState::Opening,
            items: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed { .. })
    }

    /// Number of items that went through `write`.
    pub fn items(&self) -> u64 {
        self.items
    }

    /// Stream-open acknowledged.
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            StreamState::Opening => {
                self.state = StreamState::Idle;
                Ok(())
            }
            other => Err(violation("open", other)),
        }
    }

    /// One item sent (service side) or received (client side).
    pub fn write(&mut self) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = StreamState::DataInFlight;
                self.items += 1;
                Ok(())
            }
            StreamState::Closed { .. } => Err(BridgeError::Disconnected),
            other => Err(violation("write", other)),
        }
    }

    /// The outstanding item was acknowledged.
    pub fn pull(&mut self) -> Result<()> {
        match self.state {
            StreamState::DataInFlight => {
                self.state = StreamState::Idle;
                Ok(())
            }
            other => Err(violation("pull", other)),
        }
    }

    /// Move to the terminal state. Returns `false` if it was already closed,
    /// so callers emit exactly one `stream-end`.
    pub fn close(&mut self, ok: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = StreamState::Closed { ok };
        true
    }
}

fn violation(op: &str, state: StreamState) -> BridgeError {
    BridgeError::Protocol(format!("{op} not allowed in state {}", state.as_str()))
}
