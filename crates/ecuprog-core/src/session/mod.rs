//! Programming session state machine
//!
//! ```text
//! Idle -> Initializing -> Ready -> Programming -> Completed -> Idle
//!              |            |           |
//!              +------------+-----------+-> Error -> Idle
//! ```
//!
//! `Idle` is both the initial state and the state every terminal outcome
//! returns to. The session is owned by the [`ProgrammingEngine`]; observers
//! only see [`SessionSnapshot`]s.

mod blocks;
mod engine;
pub(crate) mod link;
mod transfer;

pub use blocks::{block_count, split_blocks, Block};
pub use engine::{ProgramReport, ProgrammingEngine};

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::layout::MemoryLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Initializing,
    Ready,
    Programming,
    Completed,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Initializing => "Initializing",
            SessionState::Ready => "Ready",
            SessionState::Programming => "Programming",
            SessionState::Completed => "Completed",
            SessionState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Mutable session aggregate
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    /// Set once, after the first layout read
    pub memory_layout: Option<MemoryLayout>,
    pub security_granted: bool,
    pub bytes_programmed: u32,
    pub progress_percent: u8,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            memory_layout: None,
            security_granted: false,
            bytes_programmed: 0,
            progress_percent: 0,
        }
    }
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.state,
            security_granted: self.security_granted,
            bytes_programmed: self.bytes_programmed,
            progress_percent: self.progress_percent,
        }
    }
}

/// Read-only view published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub security_granted: bool,
    pub bytes_programmed: u32,
    pub progress_percent: u8,
}
