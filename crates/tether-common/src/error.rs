//! Common error types for the Tether endpoint engine.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`TetherError`].
pub type TetherResult<T> = Result<T, TetherError>;

/// How a failed step affects the surrounding lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The failure aborts the remaining sequence and is reported to the caller.
    Fatal,
    /// The failure is logged and the sequence continues.
    BestEffort,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Errors raised while attaching or detaching container endpoints.
#[derive(Error, Diagnostic, Debug)]
pub enum TetherError {
    /// The kernel rejected a new link (name collision, namespace limits).
    #[error("Failed to create link {name}: {message}")]
    #[diagnostic(code(tether::link::create))]
    LinkCreation {
        /// Link that could not be created.
        name: String,
        /// Underlying failure.
        message: String,
    },

    /// Changing link master, state, hairpin, address or a neighbor entry failed.
    #[error("Failed to update link {name}: {message}")]
    #[diagnostic(code(tether::link::mutate))]
    LinkMutation {
        /// Link being updated.
        name: String,
        /// Underlying failure.
        message: String,
    },

    /// Moving or renaming an interface inside a namespace failed.
    #[error("Namespace operation on {name} failed: {message}")]
    #[diagnostic(
        code(tether::netns),
        help("Check that the namespace handle is still valid and the interface is not busy")
    )]
    Namespace {
        /// Interface being moved or renamed.
        name: String,
        /// Underlying failure.
        message: String,
    },

    /// Inserting, appending or deleting a packet-filter rule failed.
    #[error("Failed to install rule in {table}/{chain}: {message}")]
    #[diagnostic(code(tether::rule::install))]
    RuleInstall {
        /// Filter table.
        table: String,
        /// Filter chain.
        chain: String,
        /// Underlying failure.
        message: String,
    },

    /// Listing or checking packet-filter rules failed.
    #[error("Failed to query rules in {table}/{chain}: {message}")]
    #[diagnostic(code(tether::rule::query))]
    RuleQuery {
        /// Filter table.
        table: String,
        /// Filter chain.
        chain: String,
        /// Underlying failure.
        message: String,
    },

    /// A CIDR, IP or MAC string could not be parsed.
    #[error("Invalid address {value}: {message}")]
    #[diagnostic(code(tether::address::parse))]
    AddressParse {
        /// The rejected input.
        value: String,
        /// Parser message.
        message: String,
    },

    /// The object being created is already present.
    #[error("Already exists: {what}")]
    #[diagnostic(code(tether::exists))]
    AlreadyExists {
        /// Description of the existing object.
        what: String,
    },

    /// An external command exited unsuccessfully.
    #[error("Command `{command}` failed (exit code {code:?}): {stderr}")]
    #[diagnostic(code(tether::command))]
    Command {
        /// Full command line.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Invalid endpoint ID format.
    #[error("Invalid endpoint ID: {id}")]
    #[diagnostic(
        code(tether::endpoint::invalid_id),
        help("Endpoint IDs must be alphanumeric with '-', '_' or '.', 1-128 characters")
    )]
    InvalidEndpointId {
        /// The invalid endpoint ID.
        id: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(tether::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(tether::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(tether::serialization))]
    Serialization(String),

    /// A lifecycle step failed; carries the step name and its severity.
    #[error("{operation} failed ({severity}): {source}")]
    #[diagnostic(code(tether::step))]
    Step {
        /// Name of the failed lifecycle step.
        operation: &'static str,
        /// Severity the policy assigned to the step.
        severity: Severity,
        /// The underlying failure.
        #[source]
        source: Box<TetherError>,
    },
}

impl TetherError {
    /// Build an [`TetherError::AddressParse`] from any displayable parser error.
    pub fn address(value: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::AddressParse {
            value: value.into(),
            message: err.to_string(),
        }
    }

    /// Severity attached to this error. Errors raised outside a lifecycle step are fatal.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Step { severity, .. } => *severity,
            _ => Severity::Fatal,
        }
    }

    /// Returns true if the error reports an object that already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Step { source, .. } => source.is_already_exists(),
            Self::Command { stderr, .. } => stderr.to_lowercase().contains("file exists"),
            _ => false,
        }
    }

    /// Unwrap [`TetherError::Step`] layers down to the originating error.
    #[must_use]
    pub fn root(&self) -> &TetherError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TetherError {
    fn from(err: toml::de::Error) -> Self {
        TetherError::Config {
            message: err.to_string(),
        }
    }
}

impl From<ipnet::AddrParseError> for TetherError {
    fn from(err: ipnet::AddrParseError) -> Self {
        TetherError::AddressParse {
            value: String::new(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TetherError::LinkCreation {
            name: "vth0".to_string(),
            message: "File exists".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to create link vth0: File exists");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TetherError = io_err.into();
        assert!(matches!(err, TetherError::Io(_)));
    }

    #[test]
    fn step_carries_severity() {
        let err = TetherError::Step {
            operation: "set link master",
            severity: Severity::Fatal,
            source: Box::new(TetherError::LinkMutation {
                name: "vth0".to_string(),
                message: "no such device".to_string(),
            }),
        };
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(matches!(err.root(), TetherError::LinkMutation { .. }));
    }

    #[test]
    fn bare_errors_are_fatal() {
        let err = TetherError::Config {
            message: "bad".to_string(),
        };
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn already_exists_detection() {
        let err = TetherError::Command {
            command: "ip addr add".to_string(),
            code: Some(2),
            stderr: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(err.is_already_exists());
        assert!(
            TetherError::AlreadyExists {
                what: "address".to_string()
            }
            .is_already_exists()
        );
    }
}
