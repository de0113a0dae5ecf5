//! Error types and result handling for fluxgate.

use std::fmt;

/// Main error type for fluxgate operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Configuration related errors (static or dynamic)
    Config {
        message: String,
        source: Option<String>,
    },
    /// A cross-source reference rejected by the sanitiser
    Reference {
        message: String,
        name: String,
    },
    /// Rule parsing errors
    Rule {
        message: String,
        rule: String,
    },
    /// Network related errors
    Network {
        message: String,
        kind: NetworkErrorKind,
    },
    /// Gateway-API translation or status errors
    Gateway {
        message: String,
        resource: String,
    },
    /// Internal system errors
    Internal {
        message: String,
    },
}

/// Network error categories
#[derive(Debug, Clone)]
pub enum NetworkErrorKind {
    /// Connection failed
    ConnectionFailed,
    /// Timeout occurred
    Timeout,
    /// Certificate/TLS error
    Tls,
    /// Protocol error
    Protocol,
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>, T: Into<String>>(message: S, source: T) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a reference error
    pub fn reference<S: Into<String>, T: Into<String>>(message: S, name: T) -> Self {
        Self::Reference {
            message: message.into(),
            name: name.into(),
        }
    }

    /// Create a rule parsing error
    pub fn rule<S: Into<String>, T: Into<String>>(message: S, rule: T) -> Self {
        Self::Rule {
            message: message.into(),
            rule: rule.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S, kind: NetworkErrorKind) -> Self {
        Self::Network {
            message: message.into(),
            kind,
        }
    }

    /// Create a gateway error
    pub fn gateway<S: Into<String>, T: Into<String>>(message: S, resource: T) -> Self {
        Self::Gateway {
            message: message.into(),
            resource: resource.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a reference error
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message, source } => {
                write!(f, "Configuration error: {}", message)?;
                if let Some(source) = source {
                    write!(f, " (source: {})", source)?;
                }
                Ok(())
            }
            Self::Reference { message, name } => {
                write!(f, "Reference error for '{}': {}", name, message)
            }
            Self::Rule { message, rule } => {
                write!(f, "Rule error in '{}': {}", rule, message)
            }
            Self::Network { message, kind } => {
                write!(f, "Network error ({}): {}", kind, message)
            }
            Self::Gateway { message, resource } => {
                write!(f, "Gateway error for {}: {}", resource, message)
            }
            Self::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Tls => write!(f, "TLS/certificate"),
            Self::Protocol => write!(f, "protocol"),
        }
    }
}

impl std::error::Error for Error {}

// Conversions from common error types
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                Self::network(err.to_string(), NetworkErrorKind::Timeout)
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset => {
                Self::network(err.to_string(), NetworkErrorKind::ConnectionFailed)
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config_with_source("YAML parsing failed", err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::config_with_source("JSON parsing failed", err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Self::config_with_source("Invalid address format", err.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Self::network(err.to_string(), NetworkErrorKind::Protocol)
    }
}

/// Result type alias for fluxgate operations.
pub type Result<T> = std::result::Result<T, Error>;
