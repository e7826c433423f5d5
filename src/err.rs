#![allow(non_snake_case)]

use std::collections::BTreeMap;
use std::fmt;

use crate::{IntoResponse, Uri};

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> Error {
    Error::NotFound {
        message: format!("Invalid path: {}", path),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

#[cfg(test)]
impl<T> Maybe<T> {
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Maybe::Nothing(err) => Err(err),
            Maybe::Fine(success) => Ok(success.value),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Lists are wrapped so they can be flattened into the success envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub count: usize,
    pub results: Vec<T>,
}

impl<T> From<Vec<T>> for Page<T> {
    fn from(results: Vec<T>) -> Self {
        Self {
            count: results.len(),
            results,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    NotFound { message: String },
    InvalidPayload { message: String },
    Validation { fields: BTreeMap<String, Vec<String>> },
    BulkRejected { errors: Vec<String> },
    AuthenticationFailure { message: String },
    PermissionDenied { message: String },
    NotificationFailed { message: String },
    InternalError { kind: &'static str, message: String },
    Unknown { message: String },
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{:?}", self);
        }
        (status, Json(self)).into_response()
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidPayload { .. }
            | Error::Validation { .. }
            | Error::BulkRejected { .. } => StatusCode::BAD_REQUEST,
            Error::AuthenticationFailure { .. } => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::NotificationFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::InternalError { .. } | Error::Unknown { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn unknown<S: Into<String>>(msg: S) -> Error {
        Error::Unknown {
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn denied<S: Into<String>>(msg: S) -> Error {
        Error::PermissionDenied {
            message: msg.into(),
        }
    }

    pub fn unauthenticated<S: Into<String>>(msg: S) -> Error {
        Error::AuthenticationFailure {
            message: msg.into(),
        }
    }

    /// Single field-level validation error.
    pub fn field<F: Into<String>, S: Into<String>>(field: F, msg: S) -> Error {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), vec![msg.into()]);
        Error::Validation { fields }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound { message }
            | Error::InvalidPayload { message }
            | Error::AuthenticationFailure { message }
            | Error::PermissionDenied { message }
            | Error::NotificationFailed { message }
            | Error::Unknown { message } => f.write_str(message),
            Error::InternalError { kind, message } => write!(f, "{}: {}", kind, message),
            Error::Validation { fields } => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|(field, errors)| format!("{}: {}", field, errors.join(" ")))
                    .collect();
                f.write_str(&parts.join("; "))
            }
            Error::BulkRejected { errors } => f.write_str(&errors.join("\n")),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::not_found("Requested record does not exist"),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned());
                let field = db
                    .constraint()
                    .map(constraint_field)
                    .unwrap_or_else(|| "non_field_errors".to_string());
                match code.as_deref() {
                    // unique_violation
                    Some("23505") => Error::field(field, "A record with this value already exists."),
                    // foreign_key_violation
                    Some("23503") => Error::field(field, "Referenced record does not exist."),
                    // check_violation
                    Some("23514") => Error::field(field, "Value is out of the allowed range."),
                    _ => Error::InternalError {
                        kind: "DatabaseError",
                        message: db.message().to_string(),
                    },
                }
            }
            other => Error::InternalError {
                kind: "DatabaseError",
                message: other.to_string(),
            },
        }
    }
}

const TABLES: &[&str] = &[
    "trainer_applications",
    "student_attempts",
    "college_courses",
    "batch_students",
    "user_materials",
    "schedule_materials",
    "assessments",
    "schedules",
    "materials",
    "colleges",
    "courses",
    "batches",
    "expenses",
    "bills",
    "users",
];

/// `users_email_key` -> `email`, `batches_course_id_fkey` -> `course_id`
fn constraint_field(constraint: &str) -> String {
    let trimmed = constraint
        .trim_end_matches("_key")
        .trim_end_matches("_fkey")
        .trim_end_matches("_check");
    TABLES
        .iter()
        .find_map(|table| {
            trimmed
                .strip_prefix(table)
                .and_then(|rest| rest.strip_prefix('_'))
        })
        .filter(|column| !column.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        if io.kind() == std::io::ErrorKind::NotFound {
            return Error::not_found("File does not exist");
        }
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(id: uuid::Error) -> Self {
        Self::InvalidPayload {
            message: id.to_string(),
        }
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::InternalError {
            kind: "HashError",
            message: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::AuthenticationFailure {
            message: format!("Invalid token: {}", err),
        }
    }
}

impl From<MultipartError> for Error {
    fn from(err: MultipartError) -> Self {
        Self::InvalidPayload {
            message: format!("Malformed multipart body: {}", err),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}
