//! The pseudo-terminal-backed coprocess.
//!
//! Functionally the same contract as [`crate::Coprocess`], but the child's
//! standard streams are a subordinate terminal rather than pipes. A child
//! whose runtime selects its buffering from `isatty` then behaves exactly
//! as it would interactively — line buffered or unbuffered — which is the
//! only way to get prompt output from a program whose source cannot be
//! changed to flush.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;

use coproc_utils_pty::ForkedPty;
use coproc_utils_pty::MIN_SUBORDINATE_NAME_LEN;
use coproc_utils_pty::fork_attached;
use coproc_utils_pty::release;
use nix::pty::Winsize;
use nix::sys::termios::Termios;
use nix::unistd::Pid;
use tracing::debug;
use tracing::warn;

use crate::command::CommandSpec;
use crate::coprocess::try_reap;
use crate::coprocess::wait_for_exit;
use crate::error::CoprocError;
use crate::resolve::ExecPlan;
use crate::resolve::ResolveContext;

/// Subordinate-side terminal configuration, applied at allocation time.
#[derive(Default, Clone)]
pub struct PtySettings {
    pub termios: Option<Termios>,
    pub winsize: Option<Winsize>,
}

/// A coprocess attached to a pseudo-terminal.
///
/// The master descriptor is both directions: writes reach the child's
/// standard input, reads yield its standard output and standard error.
#[derive(Debug)]
pub struct PtyCoprocess {
    pid: Option<Pid>,
    master: Option<File>,
    subordinate: PathBuf,
}

impl PtyCoprocess {
    /// Starts a coprocess on a freshly allocated pseudo-terminal.
    ///
    /// `subordinate_name` receives the NUL-terminated device name of the
    /// subordinate side; it must hold at least
    /// [`coproc_utils_pty::MIN_SUBORDINATE_NAME_LEN`] bytes, checked before
    /// any resource is touched. Spec validation is identical to
    /// [`crate::Coprocess::open`].
    pub fn open(
        spec: &CommandSpec,
        settings: &PtySettings,
        subordinate_name: &mut [u8],
    ) -> Result<Self, CoprocError> {
        let has_meta = spec.validate()?;
        if subordinate_name.len() < MIN_SUBORDINATE_NAME_LEN {
            return Err(CoprocError::InvalidArgument(
                "subordinate name buffer is too small",
            ));
        }
        let plan = ExecPlan::build(spec, has_meta, &ResolveContext::from_process())?;

        let forked = fork_attached(
            subordinate_name,
            settings.termios.as_ref(),
            settings.winsize.as_ref(),
        )
        .map_err(|err| {
            // The minimum was checked above, so InvalidInput can only mean
            // this platform's device name is longer than the given buffer.
            if err.kind() == ErrorKind::InvalidInput {
                CoprocError::InvalidArgument("subordinate device name does not fit the buffer")
            } else {
                CoprocError::PtyOpen(err)
            }
        })?;

        match forked {
            // Standard streams are already the subordinate terminal; all
            // that is left is the image replacement.
            ForkedPty::Child => plan.execute(),
            ForkedPty::Parent {
                child,
                master,
                subordinate,
            } => {
                debug!(
                    pid = child.as_raw(),
                    command = spec.command(),
                    subordinate = %subordinate.display(),
                    "pty coprocess started"
                );
                Ok(Self {
                    pid: Some(child),
                    master: Some(File::from(master)),
                    subordinate,
                })
            }
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The master side, readable and writable, until closed.
    pub fn master(&mut self) -> Option<&mut File> {
        self.master.as_mut()
    }

    /// Device path of the subordinate side.
    pub fn subordinate(&self) -> &Path {
        &self.subordinate
    }

    /// Releases the terminal pairing, closes the master, and reaps the
    /// child.
    ///
    /// The release and the descriptor close happen at most once across
    /// repeated calls; once the child has been reaped, further calls skip
    /// the wait and report a zero status. Closing the master severs the
    /// child's controlling terminal, so a child blocked on terminal I/O
    /// exits (typically via `SIGHUP`) rather than deadlocking the wait.
    pub fn close(&mut self) -> Result<ExitStatus, CoprocError> {
        if let Some(master) = self.master.take() {
            release(&self.subordinate).map_err(|source| CoprocError::PtyRelease {
                name: self.subordinate.display().to_string(),
                source,
            })?;
            drop(master);
        }
        match self.pid.take() {
            Some(pid) => {
                let status = wait_for_exit(pid)?;
                debug!(pid = pid.as_raw(), ?status, "pty coprocess reaped");
                Ok(status)
            }
            None => Ok(ExitStatus::from_raw(0)),
        }
    }
}

impl Drop for PtyCoprocess {
    fn drop(&mut self) {
        if self.master.take().is_some() {
            if let Err(err) = release(&self.subordinate) {
                warn!(
                    subordinate = %self.subordinate.display(),
                    error = %err,
                    "failed to release pty on drop"
                );
            }
        }
        if let Some(pid) = self.pid.take() {
            if !try_reap(pid) {
                warn!(pid = pid.as_raw(), "pty coprocess dropped without close; child not reaped");
            }
        }
    }
}
