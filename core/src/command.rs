use std::collections::HashMap;

use crate::error::CoprocError;

/// Characters whose presence in a command string means the string must be
/// handed to `sh -c` verbatim rather than executed directly.
pub const SHELL_METACHARACTERS: &str = "|&;()<>[]{}$`'~\"\\*? \t\r\n";

/// Purely lexical test for shell metacharacters. No attempt is made to parse
/// shell syntax; a quoted or escaped metacharacter still counts.
pub fn has_shell_metacharacters(command: &str) -> bool {
    command.chars().any(|c| SHELL_METACHARACTERS.contains(c))
}

/// What to run as a coprocess.
///
/// `command` is either a program name/path or a full shell command string.
/// The two forms are mutually exclusive and the choice must be explicit:
///
/// - no metacharacters in `command`: an argument vector is required and the
///   command is executed directly (or located via `PATH` when it contains
///   no slash);
/// - metacharacters present: the argument vector must be absent and the
///   whole string is delegated to `sh -c`.
///
/// Any other combination is rejected by `open`. The asymmetry is a safety
/// rail: a caller assembling `command` from untrusted input cannot drift
/// into interpreter invocation without also having dropped its own argv.
///
/// When no environment is given the child inherits a snapshot of the
/// current process environment, taken at `open` time.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    command: String,
    argv: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            argv: None,
            env: None,
        }
    }

    /// Sets the argument vector, `argv[0]` included.
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a variable to an explicit child environment. The first call
    /// switches the spec from "inherit the current environment" to "use
    /// exactly the given variables".
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn argv_slice(&self) -> Option<&[String]> {
        self.argv.as_deref()
    }

    pub fn env_map(&self) -> Option<&HashMap<String, String>> {
        self.env.as_ref()
    }

    /// Enforces the cross-field contract shared by both spawn entry points.
    /// Returns the classification so it is computed exactly once per spawn.
    pub(crate) fn validate(&self) -> Result<bool, CoprocError> {
        if self.command.is_empty() {
            return Err(CoprocError::InvalidArgument("command is empty"));
        }
        if self.command.as_bytes().contains(&0) {
            return Err(CoprocError::InvalidArgument("command contains NUL"));
        }

        let has_meta = has_shell_metacharacters(&self.command);
        match (&self.argv, has_meta) {
            (Some(_), true) => {
                return Err(CoprocError::InvalidArgument(
                    "argv must be absent when the command contains shell metacharacters",
                ));
            }
            (None, false) => {
                return Err(CoprocError::InvalidArgument(
                    "argv is required when the command contains no shell metacharacters",
                ));
            }
            _ => {}
        }

        if let Some(argv) = &self.argv {
            if argv.is_empty() {
                return Err(CoprocError::InvalidArgument("argv is empty"));
            }
            if argv.iter().any(|arg| arg.as_bytes().contains(&0)) {
                return Err(CoprocError::InvalidArgument("argv entry contains NUL"));
            }
        }
        if let Some(env) = &self.env {
            let nul = |s: &String| s.as_bytes().contains(&0);
            if env.keys().any(nul) || env.values().any(nul) {
                return Err(CoprocError::InvalidArgument("environment entry contains NUL"));
            }
            if env.keys().any(|k| k.contains('=')) {
                return Err(CoprocError::InvalidArgument(
                    "environment variable name contains '='",
                ));
            }
        }

        Ok(has_meta)
    }
}
