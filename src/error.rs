use axum::response::{IntoResponse, Response};
use http::StatusCode;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Conflict(String),
    Throw(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::NotFound(t.to_string())
    }

    pub fn conflict<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Conflict(t.to_string())
    }

    pub fn throw<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Throw(t.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::NotFound(err) => write!(f, "not found: {}", err),
            AppError::Conflict(err) => write!(f, "conflict: {}", err),
            AppError::Throw(err) => write!(f, "{}", err),
            AppError::InternalServerError(err) => write!(f, "{}", err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err).into_response(),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err).into_response(),
            AppError::Throw(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
            AppError::InternalServerError(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
