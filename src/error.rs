//! Error types for the device trust lifecycle.
//!
//! Components return [`Result`]; only the orchestrator turns a failure into
//! rollback and only the binary turns it into an exit code.

use std::fmt;

use thiserror::Error;

/// Result type alias using [`DeviceTrustError`].
pub type Result<T> = std::result::Result<T, DeviceTrustError>;

/// Errors that can occur while provisioning or renewing a device credential.
#[derive(Debug, Error)]
pub enum DeviceTrustError {
    /// No interactive console user is logged in.
    #[error("no interactive user logged in (console owner: '{user}')")]
    NoInteractiveUser {
        /// The console owner that was reported.
        user: String,
    },

    /// A required configuration value was not supplied.
    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),

    /// Configuration was supplied but is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential store operation failed.
    #[error("credential store error: {0}")]
    Store(String),

    /// Key generation or CSR construction failed.
    #[error("CSR error: {0}")]
    Csr(String),

    /// The CA rejected or failed an enrollment request.
    #[error("enrollment failed: {0}")]
    Enrollment(String),

    /// The CA rejected or failed a renewal request.
    #[error("renewal failed: {0}")]
    Renewal(String),

    /// The renewal proof token could not be signed with the stored key.
    #[error("signing error: {0}")]
    Signing(String),

    /// The scheduled unit could not be installed.
    #[error("scheduler install failed: {0}")]
    SchedulerInstall(String),

    /// Certificate returned by the CA or found in the store is malformed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// TLS or HTTP client configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A subprocess could not be spawned.
    #[error("command '{program}' failed: {message}")]
    Command {
        /// Program that was invoked.
        program: String,
        /// Failure description.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A provisioning stage failed and the run was rolled back.
    #[error("provisioning failed at {stage}: {source}")]
    Provisioning {
        /// Stage that was being entered when the failure happened.
        stage: Stage,
        /// Underlying failure.
        #[source]
        source: Box<DeviceTrustError>,
    },
}

/// Provisioning stage names used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Preparing the credential store.
    StoreReady,
    /// Obtaining or reusing a credential.
    CredentialReady,
    /// Granting key access partitions.
    PartitionsConfigured,
    /// Applying trust preferences.
    BrowsersConfigured,
    /// Installing the scheduled renewal unit.
    SchedulerInstalled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::StoreReady => "store setup",
            Stage::CredentialReady => "credential setup",
            Stage::PartitionsConfigured => "access partitions",
            Stage::BrowsersConfigured => "trust preferences",
            Stage::SchedulerInstalled => "scheduler install",
        };
        f.write_str(name)
    }
}

impl DeviceTrustError {
    /// Create a no-interactive-user error.
    pub fn no_interactive_user(user: impl Into<String>) -> Self {
        Self::NoInteractiveUser { user: user.into() }
    }

    /// Create a missing configuration error.
    pub fn configuration_missing(what: impl Into<String>) -> Self {
        Self::ConfigurationMissing(what.into())
    }

    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credential store error with the given message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a CSR error with the given message.
    pub fn csr(msg: impl Into<String>) -> Self {
        Self::Csr(msg.into())
    }

    /// Create an enrollment error with the given message.
    pub fn enrollment(msg: impl Into<String>) -> Self {
        Self::Enrollment(msg.into())
    }

    /// Create a renewal error with the given message.
    pub fn renewal(msg: impl Into<String>) -> Self {
        Self::Renewal(msg.into())
    }

    /// Create a signing error with the given message.
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Create a scheduler install error with the given message.
    pub fn scheduler_install(msg: impl Into<String>) -> Self {
        Self::SchedulerInstall(msg.into())
    }

    /// Create a certificate error with the given message.
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a TLS error with the given message.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a command error for the given program.
    pub fn command(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Wrap an error as the failure of a provisioning stage.
    pub fn provisioning(stage: Stage, source: DeviceTrustError) -> Self {
        Self::Provisioning {
            stage,
            source: Box::new(source),
        }
    }

    /// Returns the failed stage if this is a provisioning error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Provisioning { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns true if the error stems from missing or invalid configuration.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::ConfigurationMissing(_) | Self::Config(_) => true,
            Self::Provisioning { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

impl From<openssl::error::ErrorStack> for DeviceTrustError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Store(format!("openssl: {}", err))
    }
}
