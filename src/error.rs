use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Malformed input {input:?}: {reason}"))]
    MalformedInput { input: String, reason: String },

    #[snafu(display("{item} is {state}"))]
    ConflictingState { item: String, state: String },

    #[snafu(display("Validation failed: {message}"))]
    Validation { message: String },

    #[snafu(display("Archive file {} is missing", path.display()))]
    ArchiveFileMissing { path: PathBuf },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Filesystem error at {}", path.display()))]
    Io {
        path: PathBuf,
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn conflicting_state(item: impl ToString, state: impl ToString) -> Self {
        Self::ConflictingState {
            item: item.to_string(),
            state: state.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn item_not_found(uuid: impl std::fmt::Display) -> Self {
        Self::not_found(format!("queue item {uuid}"))
    }

    pub fn source_not_found(source: impl std::fmt::Display) -> Self {
        Self::not_found(format!("source {source}"))
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::MalformedInput { .. }
            | Self::Validation { .. }
            | Self::InvalidParameter { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::ConflictingState { .. } => actix_web::http::StatusCode::CONFLICT,

            Self::ArchiveFileMissing { .. } => actix_web::http::StatusCode::GONE,

            Self::Sqlx { .. } | Self::Io { .. } => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,

            Self::MigrationError { .. } | Self::InternalServerError { .. } => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
