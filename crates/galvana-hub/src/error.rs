// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of error kinds the telemetry pipeline can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubError {
    Unauthenticated,
    AccessDenied,
    NotFound,
    Conflict,
    QuotaExceeded,
    InvalidInput,
    SafetyViolation,
    EmergencyStopActive,
    UnknownDriver,
    ConnectionFailed,
    StartFailed,
    BusUnavailable,
    Timeout,
    Cancelled,
    Internal,
}

impl HubError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::AccessDenied => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::QuotaExceeded => 429,
            Self::InvalidInput => 400,
            Self::SafetyViolation => 400,
            Self::EmergencyStopActive => 409,
            Self::UnknownDriver => 404,
            Self::ConnectionFailed => 500,
            Self::StartFailed => 400,
            Self::BusUnavailable => 503,
            Self::Timeout => 504,
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::SafetyViolation => "SAFETY_VIOLATION",
            Self::EmergencyStopActive => "EMERGENCY_STOP_ACTIVE",
            Self::UnknownDriver => "UNKNOWN_DRIVER",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::StartFailed => "START_FAILED",
            Self::BusUnavailable => "BUS_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }

    /// The WebSocket close code this error maps to when surfaced at the WS
    /// handshake/handler boundary. Orthogonal to `http_status`.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            Self::Unauthenticated | Self::AccessDenied | Self::NotFound => 1008,
            Self::QuotaExceeded => 1013,
            _ => 1011,
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for HubError {}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        self.to_http_response(default_message(&self)).into_response()
    }
}

fn default_message(err: &HubError) -> &'static str {
    match err {
        HubError::Unauthenticated => "missing or invalid bearer token",
        HubError::AccessDenied => "principal does not own this run",
        HubError::NotFound => "not found",
        HubError::Conflict => "conflicting transition in progress",
        HubError::QuotaExceeded => "max connections per principal exceeded",
        HubError::InvalidInput => "invalid input",
        HubError::SafetyViolation => "value outside configured safety bounds",
        HubError::EmergencyStopActive => "session is latched; call reset first",
        HubError::UnknownDriver => "unknown driver",
        HubError::ConnectionFailed => "driver refused connection",
        HubError::StartFailed => "run failed to start",
        HubError::BusUnavailable => "frame bus unavailable",
        HubError::Timeout => "operation timed out",
        HubError::Cancelled => "cancelled",
        HubError::Internal => "internal error",
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
