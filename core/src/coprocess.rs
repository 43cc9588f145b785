//! The pipe-backed coprocess: create, talk, tear down.

use std::fs::File;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::fd::OwnedFd;
use std::os::raw::c_int;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::unistd::ForkResult;
use nix::unistd::Pid;
use nix::unistd::fork;
use nix::unistd::pipe;
use tracing::debug;
use tracing::warn;

use crate::command::CommandSpec;
use crate::error::CoprocError;
use crate::resolve::ExecPlan;
use crate::resolve::ResolveContext;

/// A child process wired up as a pipeline filter.
///
/// Bytes written to the input end become the child's standard input; the
/// output end yields the child's standard output and standard error, merged
/// into one stream. The handle does not buffer or interpret either stream.
///
/// Note that a child doing fully buffered standard I/O (the libc default
/// when not attached to a terminal) will not flush promptly over pipes; use
/// [`crate::PtyCoprocess`] when the child's buffering cannot be changed.
#[derive(Debug)]
pub struct Coprocess {
    pid: Option<Pid>,
    to: Option<File>,
    from: Option<File>,
}

impl Coprocess {
    /// Starts a coprocess.
    ///
    /// Fails with [`CoprocError::InvalidArgument`] before creating anything
    /// when the spec violates the metacharacter/argv contract. Resource
    /// failures roll back whatever was already created; on success the
    /// child has been forked but not awaited — a command that cannot be
    /// resolved surfaces later, as the exit status reported by
    /// [`Coprocess::close`].
    pub fn open(spec: &CommandSpec) -> Result<Self, CoprocError> {
        let has_meta = spec.validate()?;
        let plan = ExecPlan::build(spec, has_meta, &ResolveContext::from_process())?;

        let (to_read, to_write) = pipe().map_err(|errno| CoprocError::CreatePipe {
            which: "inbound",
            source: errno.into(),
        })?;
        // From here on, early returns drop the fds opened above: the
        // rollback the failure contract requires is ownership.
        let (from_read, from_write) = pipe().map_err(|errno| CoprocError::CreatePipe {
            which: "outbound",
            source: errno.into(),
        })?;

        // SAFETY: the child branch touches nothing but the plan and raw
        // descriptor calls before exec or _exit.
        match unsafe { fork() } {
            Err(errno) => Err(CoprocError::Fork(errno.into())),
            Ok(ForkResult::Child) => {
                drop(to_write);
                drop(from_read);
                wire_child_stdio(to_read, from_write);
                plan.execute()
            }
            Ok(ForkResult::Parent { child }) => {
                drop(to_read);
                drop(from_write);
                debug!(pid = child.as_raw(), command = spec.command(), "coprocess started");
                Ok(Self {
                    pid: Some(child),
                    to: Some(File::from(to_write)),
                    from: Some(File::from(from_read)),
                })
            }
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Writable end feeding the child's standard input, until closed.
    pub fn input(&mut self) -> Option<&mut File> {
        self.to.as_mut()
    }

    /// Readable end carrying the child's merged stdout/stderr, until closed.
    pub fn output(&mut self) -> Option<&mut File> {
        self.from.as_mut()
    }

    /// Half-closes the input so the child sees end-of-file. Idempotent.
    pub fn close_input(&mut self) {
        self.to.take();
    }

    /// Closes both descriptors and reaps the child.
    ///
    /// Each descriptor is closed at most once across repeated calls. Both
    /// ends are severed before waiting so a child blocked on a full output
    /// pipe cannot deadlock against us. Once the child has been reaped,
    /// further calls skip the wait and report a zero status.
    pub fn close(&mut self) -> Result<ExitStatus, CoprocError> {
        self.to.take();
        self.from.take();
        match self.pid.take() {
            Some(pid) => {
                let status = wait_for_exit(pid)?;
                debug!(pid = pid.as_raw(), ?status, "coprocess reaped");
                Ok(status)
            }
            None => Ok(ExitStatus::from_raw(0)),
        }
    }
}

impl Drop for Coprocess {
    fn drop(&mut self) {
        self.to.take();
        self.from.take();
        if let Some(pid) = self.pid.take() {
            // Severing the pipes usually makes the child exit; reap it if it
            // already has, but never block in a destructor.
            if !try_reap(pid) {
                warn!(pid = pid.as_raw(), "coprocess dropped without close; child not reaped");
            }
        }
    }
}

/// Child-side: move the pipe ends onto fds 0 and 1, then mirror stdout onto
/// stderr so both streams interleave on the single outbound channel. Any
/// failure here ends the child; there is no parent to report to.
pub(crate) fn wire_child_stdio(stdin_fd: OwnedFd, stdout_fd: OwnedFd) {
    install(stdin_fd, libc::STDIN_FILENO);
    install(stdout_fd, libc::STDOUT_FILENO);
    if unsafe { libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) } == -1 {
        unsafe { libc::_exit(1) };
    }
}

/// Duplicates `fd` onto `target` unless it is already there.
fn install(fd: OwnedFd, target: c_int) {
    let raw = fd.into_raw_fd();
    if raw == target {
        return;
    }
    if unsafe { libc::dup2(raw, target) } == -1 {
        unsafe { libc::_exit(1) };
    }
    unsafe { libc::close(raw) };
}

/// Blocks until the child terminates, retrying interrupted waits.
pub(crate) fn wait_for_exit(pid: Pid) -> Result<ExitStatus, CoprocError> {
    let mut status: c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(CoprocError::Wait {
                pid: pid.as_raw(),
                source: err,
            });
        }
        return Ok(ExitStatus::from_raw(status));
    }
}

/// Non-blocking reap for the drop path. Returns true when the child no
/// longer needs reaping.
pub(crate) fn try_reap(pid: Pid) -> bool {
    let mut status: c_int = 0;
    let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::WNOHANG) };
    if rc == pid.as_raw() {
        return true;
    }
    rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD)
}
