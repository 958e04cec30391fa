//! Error types for plugin host operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error category, used by callers that render outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Manifest or security check failed.
    Validation,
    /// Plugin or dependency absent.
    NotFound,
    /// Duplicate install, already active, version mismatch.
    Conflict,
    /// Module load exceeded its bound.
    Timeout,
    /// A lifecycle callback or collaborator failed.
    Runtime,
    /// Another operation is in flight for the same plugin.
    Concurrency,
}

/// Errors that can occur during plugin operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Plugin path is not an existing directory.
    #[error("plugin directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// Manifest file or package descriptor is absent.
    #[error("required file missing: {}", .0.display())]
    ManifestMissing(PathBuf),

    /// Manifest failed to parse or validate.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Missing required field in manifest.
    #[error("missing required manifest field: {0}")]
    MissingManifestField(String),

    /// Declared main entry does not exist.
    #[error("main file not found: {}", .0.display())]
    MainFileMissing(PathBuf),

    /// Declared main entry resolves outside the plugin directory.
    #[error("main file {} escapes plugin directory {}", .main.display(), .dir.display())]
    MainFileOutsideDirectory {
        /// Resolved main path.
        main: PathBuf,
        /// Plugin directory.
        dir: PathBuf,
    },

    /// Module load did not finish in time.
    #[error("loading {name} timed out after {timeout:?}")]
    LoadTimeout {
        /// Plugin name.
        name: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// Module did not export a usable plugin constructor.
    #[error("invalid plugin export: {0}")]
    InvalidExport(String),

    /// Module evaluation or constructor failed.
    #[error("plugin instantiation failed: {0}")]
    Instantiation(String),

    /// Plugin not found.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin already installed.
    #[error("plugin already installed: {0}")]
    AlreadyInstalled(String),

    /// Plugin already active.
    #[error("plugin already active: {0}")]
    AlreadyActive(String),

    /// Plugin is not active.
    #[error("plugin is not active: {0}")]
    NotActive(String),

    /// One or more dependencies are not registered.
    #[error("{plugin} has missing dependencies: {}", .missing.join(", "))]
    DependencyMissing {
        /// Dependent plugin.
        plugin: String,
        /// Unregistered dependency names.
        missing: Vec<String>,
    },

    /// One or more dependencies are registered at an incompatible version.
    #[error("{plugin} has dependency conflicts: {}", .conflicts.join(", "))]
    DependencyConflict {
        /// Dependent plugin.
        plugin: String,
        /// Human-readable conflict descriptions.
        conflicts: Vec<String>,
    },

    /// Update candidate declares a different name.
    #[error("update candidate is {found}, expected {expected}")]
    NameMismatch {
        /// Name being updated.
        expected: String,
        /// Name found in the candidate manifest.
        found: String,
    },

    /// A lifecycle callback failed.
    #[error("{stage} callback of {plugin} failed: {message}")]
    Lifecycle {
        /// Plugin name.
        plugin: String,
        /// Callback that failed.
        stage: &'static str,
        /// Failure message.
        message: String,
    },

    /// Another operation for this plugin is in flight.
    #[error("operation already in progress for {0}")]
    OperationInProgress(String),

    /// Entry in invalid state for operation.
    #[error("invalid plugin state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Hook channel used with a different payload type than declared.
    #[error("hook {hook} carries {expected}, not {found}")]
    PayloadMismatch {
        /// Channel name.
        hook: String,
        /// Declared payload type.
        expected: &'static str,
        /// Offered payload type.
        found: &'static str,
    },

    /// Settings rejected by the plugin's schema.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Durable record store failure.
    #[error("record store error: {0}")]
    Store(String),

    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create a missing manifest field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingManifestField(field.into())
    }

    /// Create a lifecycle callback failure.
    pub fn lifecycle(plugin: impl Into<String>, stage: &'static str, msg: impl Into<String>) -> Self {
        Self::Lifecycle {
            plugin: plugin.into(),
            stage,
            message: msg.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a record store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DirectoryNotFound(_) => "DIRECTORY_NOT_FOUND",
            Self::ManifestMissing(_) => "MANIFEST_MISSING",
            Self::InvalidManifest(_) | Self::MissingManifestField(_) => "MANIFEST_INVALID",
            Self::MainFileMissing(_) => "MAIN_FILE_MISSING",
            Self::MainFileOutsideDirectory { .. } => "MAIN_FILE_OUTSIDE_DIRECTORY",
            Self::LoadTimeout { .. } => "LOAD_TIMEOUT",
            Self::InvalidExport(_) => "INVALID_EXPORT",
            Self::Instantiation(_) => "INSTANTIATION_ERROR",
            Self::PluginNotFound(_) => "PLUGIN_NOT_FOUND",
            Self::AlreadyInstalled(_) => "ALREADY_INSTALLED",
            Self::AlreadyActive(_) => "ALREADY_ACTIVE",
            Self::NotActive(_) => "NOT_ACTIVE",
            Self::DependencyMissing { .. } => "DEPENDENCY_MISSING",
            Self::DependencyConflict { .. } => "DEPENDENCY_CONFLICT",
            Self::NameMismatch { .. } => "NAME_MISMATCH",
            Self::Lifecycle { .. } => "LIFECYCLE_FAILED",
            Self::OperationInProgress(_) => "OPERATION_IN_PROGRESS",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::PayloadMismatch { .. } => "HOOK_PAYLOAD_MISMATCH",
            Self::InvalidSettings(_) => "SETTINGS_INVALID",
            Self::Store(_) => "STORE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            #[cfg(feature = "watch")]
            Self::Watch(_) => "WATCH_ERROR",
        }
    }

    /// Error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DirectoryNotFound(_) | Self::PluginNotFound(_) | Self::DependencyMissing { .. } => {
                ErrorKind::NotFound
            }
            Self::ManifestMissing(_)
            | Self::InvalidManifest(_)
            | Self::MissingManifestField(_)
            | Self::MainFileMissing(_)
            | Self::MainFileOutsideDirectory { .. }
            | Self::InvalidExport(_)
            | Self::PayloadMismatch { .. }
            | Self::InvalidSettings(_)
            | Self::Config(_) => ErrorKind::Validation,
            Self::AlreadyInstalled(_)
            | Self::AlreadyActive(_)
            | Self::NotActive(_)
            | Self::DependencyConflict { .. }
            | Self::NameMismatch { .. }
            | Self::InvalidState { .. } => ErrorKind::Conflict,
            Self::LoadTimeout { .. } => ErrorKind::Timeout,
            Self::OperationInProgress(_) => ErrorKind::Concurrency,
            Self::Instantiation(_) | Self::Lifecycle { .. } | Self::Store(_) | Self::Io(_) => {
                ErrorKind::Runtime
            }
            #[cfg(feature = "watch")]
            Self::Watch(_) => ErrorKind::Runtime,
        }
    }

    /// Returns true if this failure was detected before any plugin code ran.
    pub fn is_security_rejection(&self) -> bool {
        matches!(self, Self::MainFileOutsideDirectory { .. })
    }

    /// Returns true if the operation can be retried as-is later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OperationInProgress(_) | Self::LoadTimeout { .. } | Self::DependencyMissing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::plugin_not_found("my-plugin");
        assert_eq!(err.to_string(), "plugin not found: my-plugin");

        let err = Error::DependencyConflict {
            plugin: "seo-helper".into(),
            conflicts: vec!["core-utils 0.9.0 < ^1.0.0".into()],
        };
        assert!(err.to_string().contains("core-utils"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::missing_field("name").code(), "MANIFEST_INVALID");
        assert_eq!(
            Error::MainFileOutsideDirectory {
                main: "/etc/passwd".into(),
                dir: "/plugins/a".into(),
            }
            .code(),
            "MAIN_FILE_OUTSIDE_DIRECTORY"
        );
        assert_eq!(Error::OperationInProgress("a".into()).code(), "OPERATION_IN_PROGRESS");
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(Error::missing_field("name").kind(), ErrorKind::Validation);
        assert_eq!(Error::plugin_not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(Error::AlreadyActive("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::lifecycle("x", "activate", "boom").kind(), ErrorKind::Runtime);
        assert_eq!(Error::OperationInProgress("x".into()).kind(), ErrorKind::Concurrency);

        assert!(Error::OperationInProgress("x".into()).is_recoverable());
        assert!(!Error::missing_field("name").is_recoverable());
    }
}
