//! Error handler for warden.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

use crate::crypto::CryptoError;
use crate::token::CredentialError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no access credential presented")]
    NoCredentialPresented,

    #[error("access credential is malformed")]
    CredentialMalformed,

    #[error("access credential has expired")]
    CredentialExpired,

    #[error("access credential signature is invalid")]
    CredentialSignatureInvalid,

    #[error("refresh token is invalid")]
    RefreshTokenUnknown,

    #[error("identity no longer exists")]
    IdentityNotFound,

    #[error("insufficient role")]
    InsufficientRole,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error("error parsing request body")]
    ParsingForm(Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ServerError {
    /// Whether the caller may recover by rotating its refresh token.
    pub fn should_refresh(&self) -> bool {
        matches!(self, ServerError::CredentialExpired)
    }

    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::NoCredentialPresented => "NO_TOKEN",
            ServerError::CredentialMalformed | ServerError::CredentialSignatureInvalid => {
                "INVALID_TOKEN"
            },
            ServerError::CredentialExpired => "TOKEN_EXPIRED",
            ServerError::RefreshTokenUnknown => "INVALID_REFRESH_TOKEN",
            ServerError::IdentityNotFound => "USER_NOT_FOUND",
            ServerError::InsufficientRole => "FORBIDDEN",
            ServerError::InvalidCredentials => "INVALID_CREDENTIALS",
            ServerError::Validation(_) | ServerError::ParsingForm(_) | ServerError::Axum(_) => {
                "VALIDATION_ERROR"
            },
            ServerError::Sql(_) | ServerError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::NoCredentialPresented
            | ServerError::CredentialMalformed
            | ServerError::CredentialExpired
            | ServerError::CredentialSignatureInvalid
            | ServerError::IdentityNotFound => StatusCode::UNAUTHORIZED,
            ServerError::RefreshTokenUnknown | ServerError::InsufficientRole => {
                StatusCode::FORBIDDEN
            },
            ServerError::InvalidCredentials
            | ServerError::Validation(_)
            | ServerError::ParsingForm(_)
            | ServerError::Axum(_) => StatusCode::BAD_REQUEST,
            ServerError::Sql(_) | ServerError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }
}

impl From<CredentialError> for ServerError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Malformed => ServerError::CredentialMalformed,
            CredentialError::SignatureInvalid => ServerError::CredentialSignatureInvalid,
            CredentialError::Expired => ServerError::CredentialExpired,
            CredentialError::Signing(err) => ServerError::Internal {
                details: "cannot sign access credential".into(),
                source: Some(Box::new(err)),
            },
        }
    }
}

impl From<CryptoError> for ServerError {
    fn from(err: CryptoError) -> Self {
        ServerError::Internal {
            details: "cryptographic failure".into(),
            source: Some(Box::new(err)),
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    code: String,
    title: String,
    status: u16,
    detail: String,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update machine-readable code.
    pub fn code(mut self, code: &str) -> Self {
        self.code = code.into();
        self
    }

    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            code: "INTERNAL_ERROR".to_owned(),
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .code(self.code())
            .status(self.status())
            .details(&self.to_string());

        let response = match &self {
            ServerError::NoCredentialPresented => {
                response.title("Missing access credential.")
            },
            ServerError::CredentialExpired => {
                response.title("Access credential expired, refresh the session.")
            },
            ServerError::CredentialMalformed | ServerError::CredentialSignatureInvalid => {
                response.title("Invalid access credential.")
            },
            ServerError::RefreshTokenUnknown => response.title("Invalid refresh token."),
            ServerError::IdentityNotFound => response.title("User not found."),
            ServerError::InsufficientRole => {
                response.title("You are not allowed to perform this operation.")
            },
            ServerError::InvalidCredentials => response.title("Invalid email or password."),
            ServerError::Validation(validation_errors) => response
                .title("There were validation errors with your request.")
                .errors(validation_errors),
            ServerError::ParsingForm(err) => response
                .title("Server error during data parsing.")
                .details(&err.to_string()),
            ServerError::Axum(_) => {
                response.title("There were validation errors with your request.")
            },
            ServerError::Sql(err) => {
                tracing::error!(error = %err, "database request failed");

                ResponseError::default()
            },
            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");

                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "code": "INTERNAL_ERROR",
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_expired_response_carries_code() {
        let response = ServerError::CredentialExpired.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "TOKEN_EXPIRED");
        assert_eq!(body["status"], 401);
    }

    #[test]
    fn test_only_expiry_is_recoverable() {
        assert!(ServerError::CredentialExpired.should_refresh());
        assert!(!ServerError::CredentialSignatureInvalid.should_refresh());
        assert!(!ServerError::RefreshTokenUnknown.should_refresh());
        assert_eq!(ServerError::RefreshTokenUnknown.code(), "INVALID_REFRESH_TOKEN");
    }
}
