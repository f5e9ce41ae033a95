use http::StatusCode;
use std::fmt;

/// Error kinds a middleware can signal via `next(err)`.
///
/// Each variant maps to a fixed status code except `Other`, which carries an
/// explicit code for handlers that signal a status outside the named set
/// below.
#[derive(Debug, Clone)]
pub enum GatewayError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    MethodNotAllowed(String),
    NotAcceptable(String),
    PreconditionFailed(String),
    EntityTooLarge(String),
    RangeNotSatisfiable(String),
    ExpectationFailed(String),
    Internal(String),
    NotImplemented(String),
    BadGateway(String),
    ServiceUnavailable(String),
    /// A handler-supplied status that didn't map to a named kind above.
    Other(StatusCode, String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            GatewayError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            GatewayError::EntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::ExpectationFailed(_) => StatusCode::EXPECTATION_FAILED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Other(code, _) => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::BadRequest(m)
            | GatewayError::Unauthorized(m)
            | GatewayError::Forbidden(m)
            | GatewayError::NotFound(m)
            | GatewayError::MethodNotAllowed(m)
            | GatewayError::NotAcceptable(m)
            | GatewayError::PreconditionFailed(m)
            | GatewayError::EntityTooLarge(m)
            | GatewayError::RangeNotSatisfiable(m)
            | GatewayError::ExpectationFailed(m)
            | GatewayError::Internal(m)
            | GatewayError::NotImplemented(m)
            | GatewayError::BadGateway(m)
            | GatewayError::ServiceUnavailable(m)
            | GatewayError::Other(_, m) => m,
        }
    }

    /// Build from a handler-supplied status code. Unknown codes fall back to
    /// `Other` rather than `SERVER_ERROR` — the terminal emitter still writes
    /// the code the handler asked for; only a thrown fault with no status
    /// defaults to 500 (see `GatewayError::Internal`).
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::BAD_REQUEST => GatewayError::BadRequest(message),
            StatusCode::UNAUTHORIZED => GatewayError::Unauthorized(message),
            StatusCode::FORBIDDEN => GatewayError::Forbidden(message),
            StatusCode::NOT_FOUND => GatewayError::NotFound(message),
            StatusCode::METHOD_NOT_ALLOWED => GatewayError::MethodNotAllowed(message),
            StatusCode::NOT_ACCEPTABLE => GatewayError::NotAcceptable(message),
            StatusCode::PRECONDITION_FAILED => GatewayError::PreconditionFailed(message),
            StatusCode::PAYLOAD_TOO_LARGE => GatewayError::EntityTooLarge(message),
            StatusCode::RANGE_NOT_SATISFIABLE => GatewayError::RangeNotSatisfiable(message),
            StatusCode::EXPECTATION_FAILED => GatewayError::ExpectationFailed(message),
            StatusCode::NOT_IMPLEMENTED => GatewayError::NotImplemented(message),
            StatusCode::BAD_GATEWAY => GatewayError::BadGateway(message),
            StatusCode::SERVICE_UNAVAILABLE => GatewayError::ServiceUnavailable(message),
            StatusCode::INTERNAL_SERVER_ERROR => GatewayError::Internal(message),
            other => GatewayError::Other(other, message),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status(), self.message())
    }
}

impl std::error::Error for GatewayError {}
