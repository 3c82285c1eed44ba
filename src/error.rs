use core::fmt;
use std::fmt::{Display, Formatter};

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{BufMut, BytesMut};
use reqwest::header;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, warn};

/// The error type every handler, callback, and MCP call funnels through.
/// Most failures ride in as `anyhow::Error` via the blanket `From` below;
/// the dedicated variants exist where a caller needs to react to the class
/// of failure (dispatch misses, stream misuse, MCP diagnostics) or where the
/// HTTP status should differ.
pub enum AppError {
    SqlxError(sqlx::Error),
    SerdeError(sonic_rs::Error),
    /// An RPC invocation named a method that is absent or not marked callable
    MethodNotFound,
    /// A closed streaming sink was written to again
    StreamClosed,
    /// MCP connection and OAuth failures carry their precise diagnostic string
    Mcp(Box<str>),
    UserError((StatusCode, Box<str>)),
    Generic(anyhow::Error),
}

/// The JSON body clients get when something fails over HTTP: the error
/// class plus a human-readable message
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    error_type: String,
    message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(value: AppError) -> Self {
        ErrorResponse {
            error_type: value.r#type(),
            message: value.to_string(),
        }
    }
}

/// JSON body wrapper backed by `sonic_rs`, used for every built-in endpoint
/// response and for parsing bodies that arrive through the instance mailbox
pub struct AppJson<T>(pub T);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Caller mistakes are only worth a warning; storage and internal
        // failures are ours and get the error level
        match self {
            AppError::SerdeError(_)
            | AppError::MethodNotFound
            | AppError::StreamClosed
            | AppError::Mcp(_)
            | AppError::UserError(_) => warn!("{}", self),
            AppError::SqlxError(_) | AppError::Generic(_) => error!("{}", self),
        }
        let (status, message) = match &self {
            AppError::SerdeError(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::MethodNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::StreamClosed => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Mcp(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::UserError((code, e)) => (*code, e.to_string()),
            // Whatever the detail was, it stays in the log; clients only
            // learn that the server faulted
            AppError::SqlxError(_) | AppError::Generic(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_owned(),
            ),
        };
        (
            status,
            AppJson(ErrorResponse {
                error_type: self.r#type(),
                message,
            }),
        )
            .into_response()
    }
}

impl AppError {
    /// The error class, as reported in `ErrorResponse.errorType`
    pub fn r#type(&self) -> String {
        match self {
            AppError::SerdeError(_) => "SerdeError".to_owned(),
            AppError::MethodNotFound => "MethodNotFound".to_owned(),
            AppError::StreamClosed => "StreamClosed".to_owned(),
            AppError::Mcp(_) => "Mcp".to_owned(),
            AppError::SqlxError(_) => "SqlxError".to_owned(),
            AppError::Generic(_) => "Generic".to_owned(),
            AppError::UserError(_) => "User".to_owned(),
        }
    }

    /// Shorthand for MCP failures, which carry exact diagnostic strings
    pub fn mcp(msg: impl Into<Box<str>>) -> Self {
        AppError::Mcp(msg.into())
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            AppError::SerdeError(e) => write!(f, "{}", e),
            AppError::MethodNotFound => write!(f, "method not found"),
            AppError::StreamClosed => write!(f, "StreamingResponse is already closed"),
            AppError::Mcp(e) => write!(f, "{}", e),
            AppError::SqlxError(e) => write!(f, "{}", e),
            AppError::Generic(err) => write!(f, "{}", err),
            AppError::UserError((_, err)) => write!(f, "{}", err),
        }
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} ({})", self, self.r#type())
    }
}

// Blanket conversion so `?` works on any error in handler code. The anyhow
// value is sniffed with downcast_ref first (downcast by value would consume
// it on a miss) and re-sorted into the variant that knows its HTTP status;
// everything unrecognized stays Generic.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err: anyhow::Error = err.into();
        if err.downcast_ref::<sqlx::Error>().is_some() {
            return Self::SqlxError(err.downcast().unwrap());
        } else if err.downcast_ref::<sonic_rs::Error>().is_some() {
            return Self::SerdeError(err.downcast().unwrap());
        }
        Self::Generic(err)
    }
}

impl<T> AppJson<T>
where
    T: DeserializeOwned,
{
    /// Parse a request body. The built-in endpoints receive their bodies
    /// through the instance mailbox rather than an axum extractor, so this
    /// is the only decode path.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        let deserializer = &mut sonic_rs::Deserializer::from_slice(bytes);
        serde::Deserialize::deserialize(deserializer)
            .map(AppJson)
            .map_err(AppError::SerdeError)
    }
}

/// Whether a request declares a JSON body. Accepts `application/json` and
/// any `application/*+json` flavor; a missing or unparseable content type is
/// simply not JSON.
pub fn json_content_type(headers: &HeaderMap) -> bool {
    let Some(mime) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
    else {
        return false;
    };
    mime.type_() == "application"
        && (mime.subtype() == "json" || mime.suffix().map_or(false, |name| name == "json"))
}

impl<T> IntoResponse for AppJson<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        // Serialize straight into a BytesMut so the frozen buffer becomes
        // the response body without another copy
        let mut buf = BytesMut::with_capacity(128).writer();
        match sonic_rs::to_writer(&mut buf, &self.0) {
            Ok(()) => (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
                )],
                buf.into_inner().freeze(),
            )
                .into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(mime::TEXT_PLAIN_UTF_8.as_ref()),
                )],
                err.to_string(),
            )
                .into_response(),
        }
    }
}
