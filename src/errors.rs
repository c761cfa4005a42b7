use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("No todo with id {0}.")]
    NotFound(String),
    #[error("Todo is in read-only mode because there are multiple todos in {0}")]
    RecordReadOnly(String),
    #[error("Unknown field \"{0}\"")]
    UnknownSortField(String),
    #[error("No lists found matching {0}, create a directory for a new list")]
    NoListsFound(String),
    #[error("You must set \"default_list\" or specify a list explicitly.")]
    AmbiguousDefaultList,
    #[error("Unknown list \"{0}\"")]
    UnknownList(String),
    #[error("Invalid date: {0}")]
    InvalidDate(String),
    #[error("No SUMMARY specified")]
    MissingSummary,
    #[error("Priority must be between 0 and 9, got {0}")]
    InvalidPriority(u8),
    #[error("Percent complete must be between 0 and 100, got {0}")]
    InvalidPercent(u8),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("CODEC_FAILURE: {0}")]
    Codec(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// True for errors caused by what the caller asked for, as opposed to
    /// the state of the collection or the machine.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownSortField(_)
                | Self::UnknownList(_)
                | Self::InvalidDate(_)
                | Self::MissingSummary
                | Self::InvalidPriority(_)
                | Self::InvalidPercent(_)
                | Self::NotFound(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
