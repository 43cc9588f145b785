use std::io;

use thiserror::Error;

/// Errors surfaced by the coprocess lifecycle.
///
/// A coprocess that was created successfully but whose image replacement
/// failed is deliberately not represented here: by then the child is a
/// separate process whose only remaining communicative act is its exit
/// status, which [`crate::Coprocess::close`] reports.
#[derive(Debug, Error)]
pub enum CoprocError {
    /// A precondition was violated. Nothing was created.
    #[error("invalid coprocess specification: {0}")]
    InvalidArgument(&'static str),

    /// A pipe could not be created. Anything opened earlier in the same
    /// call has already been closed again.
    #[error("failed to create the {which} pipe")]
    CreatePipe {
        which: &'static str,
        #[source]
        source: io::Error,
    },

    /// Process duplication failed. Both pipes have been closed.
    #[error("failed to fork coprocess")]
    Fork(#[source] io::Error),

    /// The pseudo-terminal pair could not be allocated or attached.
    #[error("failed to open pseudo-terminal")]
    PtyOpen(#[source] io::Error),

    /// The subordinate terminal pairing could not be released at close time.
    #[error("failed to release pseudo-terminal {name}")]
    PtyRelease {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Waiting for the coprocess to terminate failed.
    #[error("failed to wait for coprocess {pid}")]
    Wait {
        pid: i32,
        #[source]
        source: io::Error,
    },
}
