#![deny(warnings)]

//! Client session runtime: optimistic progression state, reconciliation with
//! the remote authority, and the tick and autosave cadence.
//!
//! Entry point is [`start`], which returns a [`SessionHandle`].

pub mod error;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod sync;

pub use error::{ActionError, FailureKind, RemoteError, SessionError, SnapshotError, SyncError};
pub use remote::{FaultProfile, FlakyAuthority, LocalAuthority, RemoteAuthority};
pub use scheduler::{CancelToken, PersistenceScheduler};
pub use session::{
    start, Applied, Effect, SessionConfig, SessionEvent, SessionHandle, SessionView,
    ShutdownReport,
};
pub use state::{GeneratorView, ProgressionState, Purchase, UpgradeView};
pub use sync::{AttemptOutcome, Lane, Outbound, RequestState, Resolution, Step, SyncEngine};
