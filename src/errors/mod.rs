use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::machine::OperatingSystem;

/// ErrorMessageVerbosity: represents command error message's verbosity from minimal to full verbosity.
pub enum ErrorMessageVerbosity {
    SafeOnly,
    FullDetails,
}

/// CommandError: low level error, mostly returned by cloud SDKs and API clients.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct CommandError {
    /// full_details: full error message, can contains unsafe text such as passwords and tokens.
    full_details: Option<String>,
    /// message_safe: error message omitting displaying any protected data such as passwords and tokens.
    message_safe: String,
}

impl CommandError {
    /// Creates a new CommandError having both a safe and an unsafe message.
    pub fn new(message_safe: String, message_raw: Option<String>) -> Self {
        CommandError {
            full_details: message_raw,
            message_safe,
        }
    }

    /// Creates a new CommandError from safe message. To be used when message is safe.
    pub fn new_from_safe_message(message: String) -> Self {
        CommandError::new(message, None)
    }

    /// Returns CommandError message_raw. May contains unsafe text such as passwords and tokens.
    pub fn message_raw(&self) -> Option<String> {
        self.full_details.clone()
    }

    /// Returns CommandError message_safe omitting all unsafe text such as passwords and tokens.
    pub fn message_safe(&self) -> String {
        self.message_safe.to_string()
    }

    /// Returns error message based on verbosity.
    pub fn message(&self, message_verbosity: ErrorMessageVerbosity) -> String {
        match message_verbosity {
            ErrorMessageVerbosity::SafeOnly => self.message_safe.to_string(),
            ErrorMessageVerbosity::FullDetails => match &self.full_details {
                None => self.message(ErrorMessageVerbosity::SafeOnly),
                Some(full_details) => format!("{} / Full details: {}", self.message_safe, full_details),
            },
        }
    }
}

impl Default for CommandError {
    fn default() -> Self {
        Self {
            full_details: None,
            message_safe: "Unknown command error".to_string(),
        }
    }
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // By default, expose safe message only
        f.write_str(self.message(ErrorMessageVerbosity::SafeOnly).as_str())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::new("IO error".to_string(), Some(err.to_string()))
    }
}

impl From<kube::Error> for CommandError {
    fn from(err: kube::Error) -> Self {
        CommandError::new("Kubernetes API error".to_string(), Some(err.to_string()))
    }
}

impl From<reqwest::Error> for CommandError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors may carry the full request URL, keep it out of the safe message
        CommandError::new("HTTP request error".to_string(), Some(err.to_string()))
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        CommandError::new("JSON serialization error".to_string(), Some(err.to_string()))
    }
}

impl From<serde_yaml::Error> for CommandError {
    fn from(err: serde_yaml::Error) -> Self {
        CommandError::new("YAML serialization error".to_string(), Some(err.to_string()))
    }
}

impl From<tera::Error> for CommandError {
    fn from(err: tera::Error) -> Self {
        CommandError::new(
            "Template rendering error".to_string(),
            Some(format!("{err}: {:?}", err.kind)),
        )
    }
}

impl From<url::ParseError> for CommandError {
    fn from(err: url::ParseError) -> Self {
        CommandError::new("URL parsing error".to_string(), Some(err.to_string()))
    }
}

/// TerminalReason: reason recorded on the Machine status when no progress can be
/// made without human or upstream action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum TerminalReason {
    InvalidConfiguration,
    InsufficientResources,
    AuthFailure,
    #[strum(serialize = "AMITermsNotAccepted")]
    AmiTermsNotAccepted,
    #[strum(serialize = "UnsupportedOS")]
    UnsupportedOperatingSystem,
    UnsupportedArchitecture,
    InstanceNotReady,
}

/// MachineError: every driver boundary returns either nothing or one of these.
/// Terminal errors are surfaced on the Machine status and stop the reconcile
/// until the spec changes; everything else is retried by the outer loop.
#[derive(Clone, Debug, Error)]
pub enum MachineError {
    #[error("{reason}: {message}")]
    Terminal { reason: TerminalReason, message: String },
    #[error(transparent)]
    Retryable(#[from] CommandError),
    #[error("no instance found for machine `{0}`")]
    InstanceNotFound(String),
    #[error("no cloud provider registered for `{0}`")]
    ProviderNotFound(String),
}

impl MachineError {
    pub fn new_terminal(reason: TerminalReason, message: String) -> Self {
        MachineError::Terminal { reason, message }
    }

    pub fn new_invalid_configuration(message: String) -> Self {
        Self::new_terminal(TerminalReason::InvalidConfiguration, message)
    }

    pub fn new_auth_failure(message: String) -> Self {
        Self::new_terminal(TerminalReason::AuthFailure, message)
    }

    pub fn new_insufficient_resources(message: String) -> Self {
        Self::new_terminal(TerminalReason::InsufficientResources, message)
    }

    pub fn new_ami_terms_not_accepted(message: String) -> Self {
        Self::new_terminal(TerminalReason::AmiTermsNotAccepted, message)
    }

    pub fn new_unsupported_operating_system(os: OperatingSystem, provider: &str) -> Self {
        Self::new_terminal(
            TerminalReason::UnsupportedOperatingSystem,
            format!("operating system `{os}` is not supported on `{provider}`"),
        )
    }

    pub fn new_unsupported_architecture(architecture: &str, provider: &str) -> Self {
        Self::new_terminal(
            TerminalReason::UnsupportedArchitecture,
            format!("architecture `{architecture}` is not supported on `{provider}`"),
        )
    }

    /// Raised once the create-then-poll protocol exhausted its full timeout.
    pub fn new_instance_not_ready(machine_name: &str, waited: std::time::Duration) -> Self {
        Self::new_terminal(
            TerminalReason::InstanceNotReady,
            format!("instance for machine `{machine_name}` still not visible after {}s", waited.as_secs()),
        )
    }

    pub fn new_retryable(message_safe: String, message_raw: Option<String>) -> Self {
        MachineError::Retryable(CommandError::new(message_safe, message_raw))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineError::Terminal { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MachineError::InstanceNotFound(_))
    }

    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self {
            MachineError::Terminal { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_message_safe_only() {
        // setup:
        let err = CommandError::new("cannot reach API".to_string(), Some("token=supersecret".to_string()));

        // execute:
        let safe = err.message(ErrorMessageVerbosity::SafeOnly);
        let full = err.message(ErrorMessageVerbosity::FullDetails);

        // verify:
        assert_eq!(safe, "cannot reach API");
        assert!(!safe.contains("supersecret"));
        assert!(full.contains("supersecret"));
        assert_eq!(err.to_string(), safe);
    }

    #[test]
    fn test_terminal_reason_display_matches_status_reasons() {
        // setup:
        let test_cases = vec![
            (TerminalReason::InvalidConfiguration, "InvalidConfiguration"),
            (TerminalReason::InsufficientResources, "InsufficientResources"),
            (TerminalReason::AuthFailure, "AuthFailure"),
            (TerminalReason::AmiTermsNotAccepted, "AMITermsNotAccepted"),
            (TerminalReason::UnsupportedOperatingSystem, "UnsupportedOS"),
            (TerminalReason::UnsupportedArchitecture, "UnsupportedArchitecture"),
            (TerminalReason::InstanceNotReady, "InstanceNotReady"),
        ];

        for (reason, expected) in test_cases {
            // execute & verify:
            assert_eq!(reason.to_string(), expected);
        }
    }

    #[test]
    fn test_machine_error_kinds() {
        // setup:
        let terminal = MachineError::new_auth_failure("bad credentials".to_string());
        let retryable = MachineError::new_retryable("throttled".to_string(), None);
        let not_found = MachineError::InstanceNotFound("node-1".to_string());

        // verify:
        assert!(terminal.is_terminal());
        assert_eq!(terminal.terminal_reason(), Some(TerminalReason::AuthFailure));
        assert!(!retryable.is_terminal());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_terminal());
    }
}
