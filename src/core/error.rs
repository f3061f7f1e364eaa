use std::fmt;

use crate::core::domain::Category;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The project lacks the repository or staging URL the category needs.
    PrerequisiteMissing { category: Category, missing: String },
    /// The source host rejected the credential or the repository is hidden.
    RepositoryAccessDenied(String),
    /// The repository URL does not have the expected host/owner/name shape.
    InvalidRepositoryUrl(String),
    /// A single invocation exited with a nonzero status.
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
    },
    /// Every command in a method's fallback chain failed.
    MethodExecutionFailed { method: String },
    /// No strategy is registered for the category, or the stored category is unknown.
    UnsupportedCategory(String),
    /// The execution environment itself could not be started.
    ProcessSpawnFailed(String),
    /// A flow, project or result does not exist.
    NotFound(String),
    /// The requested operation is invalid in the current state.
    InvalidState(String),
    /// A persistence layer error (database, serialization).
    Persistence(String),
    /// A configuration error occurred.
    Config(String),
    /// The browser automation surface failed.
    Browser(String),
    /// An error occurred during file system operations.
    FileSystem(String),
    /// A generic system or unknown error.
    System(String),
}

impl Error {
    /// Whether a queued retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ProcessSpawnFailed(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::PrerequisiteMissing { .. } => "prerequisite_missing",
            Error::RepositoryAccessDenied(_) => "repository_access_denied",
            Error::InvalidRepositoryUrl(_) => "invalid_repository_url",
            Error::CommandFailed { .. } => "command_failed",
            Error::MethodExecutionFailed { .. } => "method_execution_failed",
            Error::UnsupportedCategory(_) => "unsupported_category",
            Error::ProcessSpawnFailed(_) => "process_spawn_failed",
            Error::NotFound(_) => "not_found",
            Error::InvalidState(_) => "invalid_state",
            Error::Persistence(_) => "persistence",
            Error::Config(_) => "config",
            Error::Browser(_) => "browser",
            Error::FileSystem(_) => "file_system",
            Error::System(_) => "system",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PrerequisiteMissing { category, missing } => {
                write!(
                    f,
                    "Project must configure a {missing} to run {} tests",
                    category.as_str()
                )
            }
            Error::RepositoryAccessDenied(msg) => {
                write!(f, "Repository access denied: {msg}")
            }
            Error::InvalidRepositoryUrl(url) => write!(f, "Invalid repository URL: {url}"),
            Error::CommandFailed { command, exit_code } => match exit_code {
                Some(code) => write!(f, "Command `{command}` exited with code {code}"),
                None => write!(f, "Command `{command}` was terminated by a signal"),
            },
            Error::MethodExecutionFailed { method } => {
                write!(f, "Method failed: {method}")
            }
            Error::UnsupportedCategory(category) => {
                write!(f, "Unsupported test category: {category}")
            }
            Error::ProcessSpawnFailed(msg) => write!(f, "Failed to start sandbox: {msg}"),
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
            Error::Persistence(msg) => write!(f, "Persistence error: {msg}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::Browser(msg) => write!(f, "Browser error: {msg}"),
            Error::FileSystem(msg) => write!(f, "File system error: {msg}"),
            Error::System(msg) => write!(f, "System error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}
