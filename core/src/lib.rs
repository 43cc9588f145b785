//! Coprocesses: child processes used as pipeline filters.
//!
//! A coprocess is spawned from a [`CommandSpec`], talked to over raw byte
//! channels, and torn down with a blocking, status-reporting close. Two
//! transports are provided: anonymous pipes ([`Coprocess`]) and a
//! pseudo-terminal ([`PtyCoprocess`]) for children whose standard I/O
//! buffering cannot be controlled.
//!
//! Command resolution mirrors the shell's: commands containing shell
//! metacharacters run under `sh -c`, paths are executed directly, bare
//! names are searched for on `PATH`, and scripts without a `#!` line fall
//! back to the interpreter.

mod command;
mod coprocess;
mod error;
mod pty;
mod resolve;

pub use command::CommandSpec;
pub use command::SHELL_METACHARACTERS;
pub use command::has_shell_metacharacters;
pub use coprocess::Coprocess;
pub use error::CoprocError;
pub use pty::PtyCoprocess;
pub use pty::PtySettings;
