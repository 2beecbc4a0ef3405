//! Failure classification and remediation directives.
//!
//! Classification is textual: the captured error output is matched against
//! a fixed, ordered set of patterns and the first match wins.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Import,
    Syntax,
    Reference,
    Type,
    Indentation,
    TestAssertion,
    Timeout,
    /// The verify command hit the denylist. Never retried.
    Forbidden,
    Unknown,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Forbidden)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Import => "import error",
            FailureKind::Syntax => "syntax error",
            FailureKind::Reference => "reference error",
            FailureKind::Type => "type error",
            FailureKind::Indentation => "indentation error",
            FailureKind::TestAssertion => "test failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Forbidden => "forbidden command",
            FailureKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Ordered patterns; earlier entries take precedence.
static PATTERNS: LazyLock<Vec<(FailureKind, Regex)>> = LazyLock::new(|| {
    [
        (
            FailureKind::Import,
            r"(?i)(importerror|modulenotfounderror|no module named|cannot find module|unresolved import)",
        ),
        (FailureKind::Syntax, r"(?i)(syntaxerror|invalid syntax|parse error|unexpected token)"),
        (
            FailureKind::Reference,
            r"(?i)(nameerror|attributeerror|referenceerror|is not defined|has no attribute|cannot find value)",
        ),
        (FailureKind::Type, r"(?i)(typeerror|mismatched types|type mismatch)"),
        (FailureKind::Indentation, r"(?i)(indentationerror|taberror|unexpected indent)"),
        (FailureKind::TestAssertion, r"(?i)(assert|\bfailed\b|\bfailures?\b)"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).unwrap()))
    .collect()
});

/// Bucket raw error output into a [`FailureKind`].
pub fn classify(output: &str) -> FailureKind {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(output))
        .map(|(kind, _)| *kind)
        .unwrap_or(FailureKind::Unknown)
}

/// Directive handed to the executor on the attempt after a failure.
pub fn remediation_hint(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Import => {
            "Fix the import error: check that every imported module exists, that relative \
             imports use the correct path, and that the dependency is declared."
        }
        FailureKind::Syntax => {
            "Fix the syntax error: check for missing brackets, colons, quotes and \
             misplaced keywords around the reported line."
        }
        FailureKind::Reference => {
            "Fix the reference error: make sure every name and attribute used is \
             defined and spelled exactly as declared."
        }
        FailureKind::Type => {
            "Fix the type error: check argument counts and the types passed to and \
             returned from each call."
        }
        FailureKind::Indentation => {
            "Fix the indentation: use consistent spaces and align every block with \
             its enclosing statement."
        }
        FailureKind::TestAssertion => {
            "The verification tests failed: compare the expected and actual values in \
             the output and correct the logic that produces them."
        }
        FailureKind::Timeout => {
            "Verification timed out: remove blocking calls, infinite loops and slow \
             operations so the check completes quickly."
        }
        FailureKind::Forbidden => {
            "The verify command is blocked by the command denylist and cannot be run."
        }
        FailureKind::Unknown => {
            "Review the error output above carefully and fix the underlying problem."
        }
    }
}
