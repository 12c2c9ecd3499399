//! The engine's error taxonomy.
//!
//! Most call sites just propagate `color_eyre::Result` with `.context(...)`
//! chains; this enum exists for the handful of places that need to match on
//! *kind* (the run driver deciding an exit code, the cleanup engine deciding
//! warn-and-skip vs. fatal). Attach one of these to a [`color_eyre::Report`]
//! with [`EngineError::attach`] rather than returning it bare, so the
//! surrounding context chain is preserved.

use color_eyre::eyre::Report;
use derive_more::Display;

/// The kinds of failure the engine can report, per the error-handling design.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum EngineError {
    #[display("invalid project configuration")]
    ConfigInvalid,
    #[display("timed out acquiring a lock")]
    LockTimeout,
    #[display("the registry is unavailable")]
    RegistryUnavailable,
    #[display("a concurrent builder published a competing artifact")]
    RegistryConflict,
    #[display("the fast index was stale")]
    IndexStale,
    #[display("the container build failed")]
    BuildFailed,
    #[display("cluster enumeration failed")]
    ClusterEnumerationFailed,
    #[display("version control is unavailable")]
    VcsUnavailable,
    #[display("a referenced commit is missing")]
    CommitMissing,
    #[display("stages must be built first")]
    StagesRequired,
}

impl EngineError {
    /// True for errors that are only fatal to the surrounding cleanup record
    /// rather than the whole run (VCS layer errors encountered while
    /// correlating a single commit).
    pub fn is_skippable_in_cleanup(&self) -> bool {
        matches!(self, Self::VcsUnavailable | Self::CommitMissing)
    }

    /// Wrap this kind as the root of a new error report, so callers can
    /// still match `report.downcast_ref::<EngineError>()` further up the
    /// call stack while getting a normal eyre message.
    pub fn attach(self) -> Report {
        Report::new(self)
    }
}

impl std::error::Error for EngineError {}
