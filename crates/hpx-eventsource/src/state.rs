//! Lifecycle flag shared by callers and the worker.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::error::{SseError, SseResult};

/// Event source lifecycle states.
///
/// Transitions only move forward: `Ready → Open → Closed` (or straight
/// `Ready → Closed`). Nothing leaves `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet opened.
    Ready,
    /// Opened; the worker is connected or reconnecting.
    Open,
    /// Terminal, will not reconnect.
    Closed,
}

impl ConnectionState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Atomic [`ConnectionState`] cell, written only through CAS and swap.
#[derive(Debug)]
pub(crate) struct StateFlag(AtomicU8);

impl StateFlag {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Ready.as_u8()))
    }

    /// Move `Ready → Open`.
    ///
    /// # Errors
    ///
    /// [`SseError::AlreadyConnected`] or [`SseError::AlreadyClosed`]
    /// depending on the state that made the transition fail.
    pub(crate) fn open(&self) -> SseResult<()> {
        match self.0.compare_exchange(
            ConnectionState::Ready.as_u8(),
            ConnectionState::Open.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => match ConnectionState::from_u8(current) {
                ConnectionState::Closed => Err(SseError::AlreadyClosed),
                _ => Err(SseError::AlreadyConnected),
            },
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    /// Swap to `Closed`, returning the previous state.
    pub(crate) fn shutdown(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.0
                .swap(ConnectionState::Closed.as_u8(), Ordering::AcqRel),
        )
    }
}
