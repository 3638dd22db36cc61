//! Error types surfaced by the progression state, the sync engine and the
//! session API.
use clicker_core::{GeneratorId, RejectReason, UpgradeId, ValidationError};
use clicker_econ::EconError;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Local validation failure. State is never mutated when one is returned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    #[error("insufficient funds: cost {cost}, balance {balance}")]
    InsufficientFunds { cost: Decimal, balance: Decimal },

    #[error("upgrade {0} already applied")]
    AlreadyApplied(UpgradeId),

    #[error("upgrade {0} is not available yet")]
    NotAvailable(UpgradeId),

    #[error("unknown generator: {0}")]
    UnknownGenerator(GeneratorId),

    #[error("unknown upgrade: {0}")]
    UnknownUpgrade(UpgradeId),

    #[error(transparent)]
    Econ(#[from] EconError),
}

/// Failure reported by a [`crate::RemoteAuthority`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("rejected by remote: {0}")]
    Rejected(RejectReason),

    #[error("remote unreachable: {0}")]
    Unreachable(String),
}

/// Terminal failure of a request after reconciliation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("rejected by remote: {0}")]
    RemoteRejected(RejectReason),

    #[error("remote did not answer in time")]
    RemoteTimeout,

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote sent an invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Rejected(reason) => SyncError::RemoteRejected(reason),
            RemoteError::Unreachable(msg) => SyncError::RemoteUnreachable(msg),
        }
    }
}

/// Snapshot could not be turned into progression state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SnapshotError {
    #[error("invalid snapshot: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Econ(#[from] EconError),
}

/// Errors returned by [`crate::SessionHandle`] calls.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("session is closed")]
    Closed,
}

/// Failure categories shown to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InsufficientFunds,
    AlreadyApplied,
    NotAvailable,
    RemoteRejected,
    RemoteTimeout,
    RemoteUnreachable,
}

impl ActionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ActionError::InsufficientFunds { .. } => FailureKind::InsufficientFunds,
            ActionError::AlreadyApplied(_) => FailureKind::AlreadyApplied,
            // Costs too large to represent are unaffordable by definition.
            ActionError::Econ(EconError::Overflow) => FailureKind::InsufficientFunds,
            ActionError::NotAvailable(_)
            | ActionError::UnknownGenerator(_)
            | ActionError::UnknownUpgrade(_)
            | ActionError::Econ(_) => FailureKind::NotAvailable,
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::RemoteRejected(_) | SyncError::InvalidSnapshot(_) => {
                FailureKind::RemoteRejected
            }
            SyncError::RemoteTimeout => FailureKind::RemoteTimeout,
            SyncError::RemoteUnreachable(_) => FailureKind::RemoteUnreachable,
        }
    }
}

impl SessionError {
    /// Player-facing category, `None` when the session itself is gone.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SessionError::Action(e) => Some(e.kind()),
            SessionError::Sync(e) => Some(e.kind()),
            SessionError::Snapshot(_) => Some(FailureKind::RemoteRejected),
            SessionError::Closed => None,
        }
    }
}
