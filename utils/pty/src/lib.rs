//! Pseudo-terminal allocation for coprocesses.
//!
//! This crate owns the controlling/subordinate terminal pairing: it opens the
//! pair, forks with the child's standard streams attached to the subordinate
//! side, and later releases the pairing. Callers never see the subordinate
//! descriptor; they get the master side plus the subordinate device name,
//! which identifies the pairing for [`release`].

use std::ffi::CString;
use std::io;
use std::io::ErrorKind;
use std::os::fd::IntoRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use nix::pty::Winsize;
use nix::pty::openpty;
use nix::sys::termios::Termios;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use nix::unistd::fork;
use nix::unistd::setsid;
use nix::unistd::ttyname;

/// Minimum capacity a subordinate-name buffer must have. Device names are
/// short on every supported platform; callers that cannot spare this much are
/// rejected before any terminal is allocated.
pub const MIN_SUBORDINATE_NAME_LEN: usize = 64;

/// Outcome of [`fork_attached`], one variant per side of the fork.
///
/// The child variant carries nothing: by the time it is returned, the calling
/// process's fds 0/1/2 are already the subordinate terminal and the only
/// remaining legal acts are exec or `_exit`.
pub enum ForkedPty {
    Parent {
        child: Pid,
        master: OwnedFd,
        subordinate: PathBuf,
    },
    Child,
}

/// Allocates a pseudo-terminal pair and forks, attaching the child to the
/// subordinate side.
///
/// `subordinate_name` receives the NUL-terminated device name; it must be at
/// least [`MIN_SUBORDINATE_NAME_LEN`] bytes or the call fails with
/// `InvalidInput` before any resource exists. `termios` and `winsize`, when
/// given, are applied to the subordinate at allocation time.
///
/// In the child, the new process becomes a session leader with the
/// subordinate as its controlling terminal, and fds 0/1/2 all refer to it.
/// The child must not return to code that expects the parent's state.
pub fn fork_attached(
    subordinate_name: &mut [u8],
    termios: Option<&Termios>,
    winsize: Option<&Winsize>,
) -> io::Result<ForkedPty> {
    if subordinate_name.len() < MIN_SUBORDINATE_NAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "subordinate name buffer must hold at least 64 bytes",
        ));
    }

    let pty = openpty(winsize, termios).map_err(io::Error::from)?;
    let subordinate = ttyname(&pty.slave).map_err(io::Error::from)?;

    let name_bytes = subordinate.as_os_str().as_bytes();
    if name_bytes.len() + 1 > subordinate_name.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "subordinate device name does not fit the caller's buffer",
        ));
    }
    subordinate_name[..name_bytes.len()].copy_from_slice(name_bytes);
    subordinate_name[name_bytes.len()] = 0;

    // SAFETY: the child branch below only performs async-signal-safe calls
    // before handing control back to the caller, which must exec or exit.
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Child => {
            drop(pty.master);
            attach_subordinate(pty.slave);
            Ok(ForkedPty::Child)
        }
        ForkResult::Parent { child } => {
            drop(pty.slave);
            Ok(ForkedPty::Parent {
                child,
                master: pty.master,
                subordinate,
            })
        }
    }
}

/// Child-side: make `subordinate` the controlling terminal and wire it to
/// fds 0/1/2. Exits the process on failure; there is no parent to report to.
fn attach_subordinate(subordinate: OwnedFd) {
    if setsid().is_err() {
        unsafe { libc::_exit(1) };
    }

    let raw = subordinate.into_raw_fd();
    if unsafe { libc::ioctl(raw, libc::TIOCSCTTY as _, 0) } == -1 {
        unsafe { libc::_exit(1) };
    }

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if raw != target && unsafe { libc::dup2(raw, target) } == -1 {
            unsafe { libc::_exit(1) };
        }
    }
    if raw > libc::STDERR_FILENO {
        unsafe { libc::close(raw) };
    }
}

/// Releases the terminal pairing identified by `subordinate`.
///
/// Restores the device to world-usable mode and root ownership, undoing any
/// session-specific state. Must be called exactly once per successful
/// allocation. `EPERM` is tolerated: on systems where `devpts` manages
/// device ownership, the kernel reclaims the node itself and an unprivileged
/// caller has nothing left to do.
pub fn release(subordinate: &Path) -> io::Result<()> {
    let path = CString::new(subordinate.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "subordinate name contains NUL"))?;

    if unsafe { libc::chmod(path.as_ptr(), 0o666) } == -1 {
        tolerate_devpts(subordinate, io::Error::last_os_error())?;
    }
    if unsafe { libc::chown(path.as_ptr(), 0, 0) } == -1 {
        tolerate_devpts(subordinate, io::Error::last_os_error())?;
    }

    Ok(())
}

/// `EPERM` means `devpts` owns the node's mode and ownership and there is
/// nothing left for this process to restore; anything else is a real failure.
fn tolerate_devpts(subordinate: &Path, err: io::Error) -> io::Result<()> {
    if err.raw_os_error() == Some(libc::EPERM) {
        tracing::debug!(
            subordinate = %subordinate.display(),
            "pty node housekeeping left to devpts"
        );
        return Ok(());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::AsFd;

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    #[test]
    fn rejects_undersized_name_buffer() {
        let mut buf = [0u8; MIN_SUBORDINATE_NAME_LEN - 1];
        let err = match fork_attached(&mut buf, None, None) {
            Err(err) => err,
            Ok(_) => panic!("undersized buffer must be rejected"),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn release_propagates_unexpected_failures() {
        let err = match release(Path::new("/dev/pts/coproc-release-test-missing")) {
            Err(err) => err,
            Ok(()) => panic!("release of a missing device must fail"),
        };
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn allocation_reports_a_device_name() -> Result<()> {
        // Allocate without forking to keep the test single-process.
        let pty = openpty(None, None)?;
        let name = ttyname(pty.slave.as_fd())?;
        assert!(name.is_absolute());
        assert!(name.as_os_str().len() + 1 <= MIN_SUBORDINATE_NAME_LEN);
        Ok(())
    }
}
