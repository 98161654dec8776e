//! Per-client sessions.
//!
//! A session is one client's connection to the manager. It owns the
//! resources created through it and remembers whether the client's last
//! remote exchange was cut short by a signal, so the next operation can tell
//! the remote side to discard the stale transaction before starting a new
//! one.

use crate::remote::RemoteAction;
use crate::stats::OpStats;
use crate::types::{Handle, Pid, SessionId};

/// Whether a session has an interrupted remote exchange pending cleanup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RestartState {
    /// No pending cleanup.
    Idle,
    /// The last exchange of `action` was interrupted mid-flight.
    Interrupted { action: RemoteAction, trans_id: u32 },
}

/// One client's view of the manager.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    /// Process the session belongs to. [`Pid::KERNEL`] for the in-kernel
    /// client.
    pub pid: Pid,
    pub restart: RestartState,
    /// Handles of resources created through this session, oldest first.
    pub resources: Vec<Handle>,
    /// Counters for operations that fail before a resource exists.
    pub stats: OpStats,
}

impl Session {
    pub(crate) fn new(id: SessionId, pid: Pid) -> Self {
        Self {
            id,
            pid,
            restart: RestartState::Idle,
            resources: Vec::new(),
            stats: OpStats::default(),
        }
    }

    /// Take the pending cleanup, if any, resetting the session to idle.
    pub(crate) fn take_restart(&mut self) -> Option<(RemoteAction, u32)> {
        match self.restart {
            RestartState::Idle => None,
            RestartState::Interrupted { action, trans_id } => {
                self.restart = RestartState::Idle;
                Some((action, trans_id))
            }
        }
    }

    /// Record an interrupted exchange for the next operation to clean up.
    pub(crate) fn note_interrupt(&mut self, action: RemoteAction, trans_id: u32) {
        self.restart = RestartState::Interrupted { action, trans_id };
    }
}
