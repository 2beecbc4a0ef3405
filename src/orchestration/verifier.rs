//! Shell verifier and the destructive-command denylist.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::orchestration::collaborators::{Verifier, VerifyOutput};
use crate::{Error, Result};

/// Built-in destructive command patterns.
const BUILTIN_DENYLIST: &[&str] = &[
    // rm -rf / or rm -rf ~ (and globbed variants)
    r"\brm\s+(-[a-zA-Z]+\s+)*-[a-zA-Z]*[rR][a-zA-Z]*\s+(-[a-zA-Z]+\s+)*(/|~/?)(\*|\s|$)",
    r"\bmkfs(\.[a-z0-9]+)?\b",
    r"\bdd\b.*\bof=/dev/",
    // fork bomb
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r"\bchmod\s+-R\s+777\s+/(\s|$)",
    r">\s*/dev/sd[a-z]",
    r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
];

static BUILTIN_PATTERNS: LazyLock<Vec<(String, Regex)>> = LazyLock::new(|| {
    BUILTIN_DENYLIST
        .iter()
        .map(|p| (p.to_string(), Regex::new(p).unwrap()))
        .collect()
});

/// Denylist applied to verify commands before anything is spawned.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    patterns: Vec<(String, Regex)>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            patterns: BUILTIN_PATTERNS.clone(),
        }
    }
}

impl CommandPolicy {
    /// Built-in patterns plus `extra` user patterns.
    ///
    /// # Errors
    /// `Validation` if any extra pattern is not a valid regex.
    pub fn with_patterns(extra: &[String]) -> Result<Self> {
        let mut policy = Self::default();
        for pattern in extra {
            let regex = Regex::new(pattern).map_err(|e| {
                Error::Validation(format!("invalid denylist pattern `{}`: {}", pattern, e))
            })?;
            policy.patterns.push((pattern.clone(), regex));
        }
        Ok(policy)
    }

    /// First pattern matching `command`, if any.
    pub fn matching_pattern(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(command))
            .map(|(p, _)| p.as_str())
    }

    pub fn check(&self, command: &str) -> Result<()> {
        match self.matching_pattern(command) {
            Some(pattern) => Err(Error::ForbiddenVerifyCommand {
                command: command.to_string(),
                pattern: pattern.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Runs verify commands with `sh -c` in the project root.
pub struct ShellVerifier {
    project_root: PathBuf,
    policy: CommandPolicy,
}

impl ShellVerifier {
    pub fn new(project_root: impl Into<PathBuf>, policy: CommandPolicy) -> Self {
        Self {
            project_root: project_root.into(),
            policy,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }
}

#[async_trait]
impl Verifier for ShellVerifier {
    async fn verify(&self, command: &str, timeout: Duration) -> Result<VerifyOutput> {
        if command.trim().is_empty() {
            warn!("empty verify command, treating as passed");
            return Ok(VerifyOutput::passed());
        }
        self.policy.check(command)?;

        debug!(command, ?timeout, "running verify command");
        let output = tokio::time::timeout(
            timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.project_root)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::VerificationTimeout(timeout))?
        .map_err(Error::Io)?;

        Ok(VerifyOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
