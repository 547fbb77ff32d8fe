//! Error types for mail-pdf-relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable(s): {}", .0.join(", "))]
    MissingEnvVars(Vec<String>),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox session errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    #[error("Failed to open mailbox {mailbox}: {reason}")]
    MailboxUnavailable { mailbox: String, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IMAP command failed: {0}")]
    Command(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),
}

impl MailError {
    /// Whether this error means the session is gone and must be re-established.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::AuthFailed { .. } | Self::ConnectionLost(_)
        )
    }
}

impl From<async_imap::error::Error> for MailError {
    fn from(e: async_imap::error::Error) -> Self {
        match e {
            async_imap::error::Error::Io(io) => Self::ConnectionLost(io.to_string()),
            async_imap::error::Error::ConnectionLost => {
                Self::ConnectionLost("server closed the connection".into())
            }
            other => Self::Command(other.to_string()),
        }
    }
}

/// Browser rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to launch browser {bin}: {reason}")]
    Launch { bin: String, reason: String },

    #[error("Browser error: {0}")]
    Browser(#[from] chromiumoxide::error::CdpError),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("{stage} timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    #[error("Browser is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static-site publishing errors.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to write publication index: {0}")]
    Index(#[from] serde_json::Error),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chat notification errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Authentication failed for {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("{method} failed on {name}: {reason}")]
    SendFailed {
        name: String,
        method: String,
        reason: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dispatch pipeline errors, tagged by the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Render stage failed: {0}")]
    Render(#[from] RenderError),

    #[error("Publish stage failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Notify stage failed: {0}")]
    Notify(#[from] NotifyError),
}

impl PipelineError {
    /// Short stage label used in logs and error notifications.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Render(_) => "render",
            Self::Publish(_) => "publish",
            Self::Notify(_) => "notify",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_faults_are_classified() {
        assert!(MailError::ConnectionLost("eof".into()).is_connection_fault());
        assert!(
            MailError::Connect {
                host: "imap.test.com".into(),
                port: 993,
                reason: "refused".into(),
            }
            .is_connection_fault()
        );
        assert!(!MailError::Command("BAD".into()).is_connection_fault());
        assert!(!MailError::Parse("garbage".into()).is_connection_fault());
    }

    #[test]
    fn imap_io_error_maps_to_connection_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = MailError::from(async_imap::error::Error::Io(io));
        assert!(err.is_connection_fault());
    }

    #[test]
    fn missing_env_vars_lists_every_key() {
        let err = ConfigError::MissingEnvVars(vec!["IMAP_USER".into(), "TARGET_SENDER".into()]);
        assert_eq!(
            err.to_string(),
            "Missing required environment variable(s): IMAP_USER, TARGET_SENDER"
        );
    }

    #[test]
    fn pipeline_error_stage_labels() {
        let err = PipelineError::from(RenderError::NotRunning);
        assert_eq!(err.stage(), "render");
        let err = PipelineError::from(PublishError::Git {
            command: "push".into(),
            stderr: "rejected".into(),
        });
        assert_eq!(err.stage(), "publish");
    }
}
