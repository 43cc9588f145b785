//! Command resolution: from a validated [`CommandSpec`] to the exact
//! sequence of image-replacement attempts the child will make.
//!
//! Everything here runs in the parent, before the process is duplicated.
//! The child inherits a fully materialized [`ExecPlan`] — every `CString`
//! and every argv/envp pointer table already built — so that after the fork
//! it performs nothing but `execve` and `_exit`. This keeps the child free
//! of allocation, which is not safe between fork and exec in a process that
//! may have other threads.

use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;

use nix::errno::Errno;

use crate::command::CommandSpec;
use crate::error::CoprocError;

const SHELL: &str = "/bin/sh";
const DEFAULT_ROOT_PATH: &str = "/bin:/usr/bin";
const DEFAULT_USER_PATH: &str = ":/bin:/usr/bin";

/// Upper bound on a constructed candidate path, terminating NUL included.
/// Candidates that would exceed it are skipped, not fatal.
const MAX_CANDIDATE_PATH: usize = 512;

/// How the process image will be replaced. Selected once per spawn and
/// never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Metacharacters present: hand the whole string to `sh -c`.
    ShellInvocation,
    /// A slash names a specific file: execute it directly.
    DirectReplacement,
    /// A bare name: try each directory on the search path in order.
    PathSearch,
}

impl Strategy {
    pub(crate) fn choose(command: &str, has_meta: bool) -> Self {
        if has_meta {
            Strategy::ShellInvocation
        } else if command.contains('/') {
            Strategy::DirectReplacement
        } else {
            Strategy::PathSearch
        }
    }
}

/// Snapshot of the process state the resolution depends on, taken in the
/// parent so plan construction is a pure function of its inputs.
pub(crate) struct ResolveContext {
    /// `PATH` of the spawning process. The search path always comes from
    /// here, never from the environment given to the child.
    pub path_var: Option<String>,
    pub superuser: bool,
    /// Current environment, substituted when the spec carries none.
    pub inherited_env: Vec<(String, String)>,
}

impl ResolveContext {
    pub(crate) fn from_process() -> Self {
        Self {
            path_var: std::env::var("PATH").ok(),
            superuser: unsafe { libc::geteuid() } == 0,
            inherited_env: std::env::vars().collect(),
        }
    }

    fn search_path(&self) -> &str {
        match &self.path_var {
            Some(path) => path,
            None if self.superuser => DEFAULT_ROOT_PATH,
            None => DEFAULT_USER_PATH,
        }
    }
}

/// One fully materialized `execve` image.
struct ExecImage {
    program: CString,
    // Keeps the strings `argv_ptrs` points into alive; the pointers stay
    // valid when the image moves because they address the heap buffers.
    #[allow(dead_code)]
    argv: Box<[CString]>,
    argv_ptrs: Box<[*const c_char]>,
}

impl ExecImage {
    fn new(program: CString, argv: Vec<CString>) -> Self {
        let argv: Box<[CString]> = argv.into();
        let argv_ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        Self {
            program,
            argv,
            argv_ptrs,
        }
    }

    /// Child-side only. Returns the failure reason; on success it does not
    /// return at all.
    fn exec(&self, envp: &[*const c_char]) -> Errno {
        unsafe { libc::execve(self.program.as_ptr(), self.argv_ptrs.as_ptr(), envp.as_ptr()) };
        Errno::last()
    }
}

struct Attempt {
    image: ExecImage,
    /// Retry with `sh` prefixed, for executables whose header is not
    /// recognized (scripts without a `#!` line).
    interpreter_fallback: Option<ExecImage>,
}

/// The complete, ordered set of image-replacement attempts for one spawn.
pub(crate) struct ExecPlan {
    attempts: Vec<Attempt>,
    searching: bool,
    // Owns the `K=V` strings `envp` points into.
    #[allow(dead_code)]
    env: Box<[CString]>,
    envp: Box<[*const c_char]>,
}

impl ExecPlan {
    pub(crate) fn build(
        spec: &CommandSpec,
        has_meta: bool,
        ctx: &ResolveContext,
    ) -> Result<Self, CoprocError> {
        let strategy = Strategy::choose(spec.command(), has_meta);

        let attempts = match strategy {
            Strategy::ShellInvocation => vec![Attempt {
                image: shell_image(spec.command())?,
                interpreter_fallback: None,
            }],
            Strategy::DirectReplacement => {
                let argv = require_argv(spec)?;
                vec![candidate_attempt(spec.command(), argv)?]
            }
            Strategy::PathSearch => {
                let argv = require_argv(spec)?;
                let mut attempts = Vec::new();
                for dir in ctx.search_path().split(':') {
                    // An empty segment denotes the current directory.
                    let candidate = if dir.is_empty() {
                        spec.command().to_string()
                    } else {
                        format!("{dir}/{}", spec.command())
                    };
                    if candidate.len() + 1 > MAX_CANDIDATE_PATH {
                        continue;
                    }
                    attempts.push(candidate_attempt(&candidate, argv)?);
                }
                attempts
            }
        };

        let env = build_env(spec, ctx)?;
        let envp = env
            .iter()
            .map(|entry| entry.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        Ok(Self {
            attempts,
            searching: strategy == Strategy::PathSearch,
            env,
            envp,
        })
    }

    /// Runs the attempts in order and terminates the process.
    ///
    /// Child-side only: by construction nothing here allocates, panics, or
    /// returns. A failed search exits with the conventional
    /// command-not-found status.
    pub(crate) fn execute(&self) -> ! {
        for attempt in &self.attempts {
            match attempt.image.exec(&self.envp) {
                Errno::ENOEXEC => {
                    // One interpreter retry, then stop searching regardless
                    // of its outcome: never execute a second same-named file
                    // after the first was found but unusable.
                    if let Some(fallback) = &attempt.interpreter_fallback {
                        fallback.exec(&self.envp);
                    }
                    break;
                }
                // EACCES, or a directory that simply lacks the file: move
                // on to the next candidate.
                _ if self.searching => continue,
                _ => break,
            }
        }
        unsafe { libc::_exit(127) }
    }

    #[cfg(test)]
    fn programs(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .filter_map(|a| a.image.program.to_str().ok())
            .collect()
    }
}

fn require_argv(spec: &CommandSpec) -> Result<&[String], CoprocError> {
    spec.argv_slice()
        .ok_or(CoprocError::InvalidArgument("argv is required"))
}

fn cstring(s: &str) -> Result<CString, CoprocError> {
    CString::new(s).map_err(|_| CoprocError::InvalidArgument("embedded NUL byte"))
}

fn shell_image(command: &str) -> Result<ExecImage, CoprocError> {
    let argv = vec![cstring("sh")?, cstring("-c")?, cstring(command)?];
    Ok(ExecImage::new(cstring(SHELL)?, argv))
}

/// Builds the attempt for one concrete path: the direct image plus the
/// interpreter-prefixed argv used when the file's header is unrecognized.
/// The fallback allocates its own owned vector; the caller's argv is never
/// mutated.
fn candidate_attempt(path: &str, argv: &[String]) -> Result<Attempt, CoprocError> {
    let direct = argv.iter().map(|arg| cstring(arg)).collect::<Result<Vec<_>, _>>()?;

    let mut with_interpreter = Vec::with_capacity(argv.len() + 1);
    with_interpreter.push(cstring(SHELL)?);
    with_interpreter.push(cstring(path)?);
    for arg in &argv[1..] {
        with_interpreter.push(cstring(arg)?);
    }

    Ok(Attempt {
        image: ExecImage::new(cstring(path)?, direct),
        interpreter_fallback: Some(ExecImage::new(cstring(SHELL)?, with_interpreter)),
    })
}

fn build_env(spec: &CommandSpec, ctx: &ResolveContext) -> Result<Box<[CString]>, CoprocError> {
    let entries: Vec<CString> = match spec.env_map() {
        Some(map) => map
            .iter()
            .map(|(k, v)| cstring(&format!("{k}={v}")))
            .collect::<Result<_, _>>()?,
        None => ctx
            .inherited_env
            .iter()
            .map(|(k, v)| cstring(&format!("{k}={v}")))
            .collect::<Result<_, _>>()?,
    };
    Ok(entries.into())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    fn ctx(path_var: Option<&str>, superuser: bool) -> ResolveContext {
        ResolveContext {
            path_var: path_var.map(str::to_string),
            superuser,
            inherited_env: vec![("HOME".to_string(), "/root".to_string())],
        }
    }

    fn argv_strings(image: &ExecImage) -> Vec<String> {
        image
            .argv
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(Strategy::choose("cat | sort", true), Strategy::ShellInvocation);
        assert_eq!(Strategy::choose("/bin/cat", false), Strategy::DirectReplacement);
        assert_eq!(Strategy::choose("cat", false), Strategy::PathSearch);
    }

    #[test]
    fn shell_invocation_is_the_exact_triple() {
        let spec = CommandSpec::new("cat | sort");
        let plan = ExecPlan::build(&spec, true, &ctx(Some("/bin"), false)).unwrap();
        assert_eq!(plan.programs(), vec!["/bin/sh"]);
        assert_eq!(
            argv_strings(&plan.attempts[0].image),
            vec!["sh", "-c", "cat | sort"]
        );
        assert!(plan.attempts[0].interpreter_fallback.is_none());
        assert!(!plan.searching);
    }

    #[test]
    fn direct_replacement_carries_an_interpreter_fallback() {
        let spec = CommandSpec::new("/bin/cat").argv(["cat", "-n"]);
        let plan = ExecPlan::build(&spec, false, &ctx(Some("/bin"), false)).unwrap();
        assert_eq!(plan.programs(), vec!["/bin/cat"]);
        let fallback = plan.attempts[0].interpreter_fallback.as_ref().unwrap();
        assert_eq!(fallback.program.to_str().unwrap(), "/bin/sh");
        assert_eq!(argv_strings(fallback), vec!["/bin/sh", "/bin/cat", "-n"]);
    }

    #[test]
    fn path_search_visits_candidates_in_order() {
        let spec = CommandSpec::new("cat").argv(["cat"]);
        let plan = ExecPlan::build(&spec, false, &ctx(Some(":/bin:/usr/bin"), false)).unwrap();
        // The empty leading segment is the current directory.
        assert_eq!(plan.programs(), vec!["cat", "/bin/cat", "/usr/bin/cat"]);
        assert!(plan.searching);
    }

    #[test]
    fn default_search_path_depends_on_privilege() {
        let spec = CommandSpec::new("cat").argv(["cat"]);
        let root = ExecPlan::build(&spec, false, &ctx(None, true)).unwrap();
        assert_eq!(root.programs(), vec!["/bin/cat", "/usr/bin/cat"]);
        let user = ExecPlan::build(&spec, false, &ctx(None, false)).unwrap();
        assert_eq!(user.programs(), vec!["cat", "/bin/cat", "/usr/bin/cat"]);
    }

    #[test]
    fn oversized_candidates_are_skipped_not_fatal() {
        let long_dir = "/x".repeat(MAX_CANDIDATE_PATH / 2 + 8);
        let path = format!("{long_dir}:/bin");
        let spec = CommandSpec::new("cat").argv(["cat"]);
        let plan = ExecPlan::build(&spec, false, &ctx(Some(&path), false)).unwrap();
        assert_eq!(plan.programs(), vec!["/bin/cat"]);
    }

    #[test]
    fn explicit_environment_replaces_inheritance() {
        let spec = CommandSpec::new("cat").argv(["cat"]).env("ONLY", "this");
        let plan = ExecPlan::build(&spec, false, &ctx(Some("/bin"), false)).unwrap();
        let entries: Vec<_> = plan
            .env
            .iter()
            .map(|e| e.to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["ONLY=this"]);
        // envp is NUL-terminated.
        assert_eq!(plan.envp.len(), entries.len() + 1);
        assert!(plan.envp[entries.len()].is_null());
    }
}
