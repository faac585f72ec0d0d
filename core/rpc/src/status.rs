// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Status codes and the status value returned by every fallible operation.
//!
//! Codes below zero and in `100..600` belong to the framework. Any other
//! positive code is a business error chosen by the application.

use std::backtrace::Backtrace;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code. The set is open: applications may use their own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code(i32);

impl Code {
    pub const UNKNOWN_ERROR: Code = Code(-1);
    pub const OK: Code = Code(0);
    pub const WRONG_CONN: Code = Code(100);
    pub const CONN_CLOSED: Code = Code(102);
    pub const WRITE_FAILED: Code = Code(104);
    pub const DIAL_FAILED: Code = Code(105);
    pub const BAD_MESSAGE: Code = Code(400);
    pub const UNAUTHORIZED: Code = Code(401);
    pub const NOT_FOUND: Code = Code(404);
    pub const MTYPE_NOT_ALLOWED: Code = Code(405);
    pub const HANDLE_TIMEOUT: Code = Code(408);
    pub const CONFLICT: Code = Code(409);
    pub const UNSUPPORTED_TX: Code = Code(410);
    pub const UNSUPPORTED_CODEC_TYPE: Code = Code(415);
    pub const INTERNAL_SERVER_ERROR: Code = Code(500);
    pub const BAD_GATEWAY: Code = Code(502);

    pub const fn new(code: i32) -> Self {
        Code(code)
    }

    pub const fn as_i32(&self) -> i32 {
        self.0
    }

    pub fn is_ok(&self) -> bool {
        *self == Code::OK
    }

    pub fn is_framework(&self) -> bool {
        self.0 < 0 || (100..600).contains(&self.0)
    }

    /// Canonical text of the code.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Code::UNKNOWN_ERROR => "Unknown Error",
            Code::OK => "OK",
            Code::WRONG_CONN => "Wrong Connection",
            Code::CONN_CLOSED => "Connection Closed",
            Code::WRITE_FAILED => "Write Failed",
            Code::DIAL_FAILED => "Dial Failed",
            Code::BAD_MESSAGE => "Bad Message",
            Code::UNAUTHORIZED => "Unauthorized",
            Code::NOT_FOUND => "Not Found",
            Code::MTYPE_NOT_ALLOWED => "Message Type Not Allowed",
            Code::HANDLE_TIMEOUT => "Handle Timeout",
            Code::CONFLICT => "Conflict",
            Code::UNSUPPORTED_TX => "Unsupported Transfer Filter",
            Code::UNSUPPORTED_CODEC_TYPE => "Unsupported Codec Type",
            Code::INTERNAL_SERVER_ERROR => "Internal Server Error",
            Code::BAD_GATEWAY => "Bad Gateway",
            Code(other) => u16::try_from(other)
                .ok()
                .and_then(|c| http::StatusCode::from_u16(c).ok())
                .and_then(|c| c.canonical_reason())
                .unwrap_or("Unknown Error"),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Code {
    fn from(code: i32) -> Self {
        Code(code)
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code.0
    }
}

/// Result of an operation: code, message and an optional cause.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    cause: String,
}

impl Status {
    pub fn new(code: impl Into<Code>, msg: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            msg: msg.into(),
            cause: String::new(),
        }
    }

    /// Status whose message is the canonical text of `code`.
    pub fn with_code(code: impl Into<Code>) -> Self {
        let code = code.into();
        Self::new(code, code.as_str())
    }

    /// Status carrying the canonical text of `code` as message and `err` as
    /// cause, optionally followed by the current backtrace.
    pub fn from_code_text(code: impl Into<Code>, err: impl fmt::Display, backtrace: bool) -> Self {
        let status = Self::with_code(code);
        if backtrace {
            status.with_cause(format!("{}\n{}", err, Backtrace::force_capture()))
        } else {
            status.with_cause(err.to_string())
        }
    }

    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = cause.into();
        self
    }

    pub fn conn_closed(cause: impl Into<String>) -> Self {
        Self::with_code(Code::CONN_CLOSED).with_cause(cause)
    }

    pub fn write_failed(cause: impl Into<String>) -> Self {
        Self::with_code(Code::WRITE_FAILED).with_cause(cause)
    }

    pub fn dial_failed(cause: impl Into<String>) -> Self {
        Self::with_code(Code::DIAL_FAILED).with_cause(cause)
    }

    pub fn bad_message(cause: impl Into<String>) -> Self {
        Self::with_code(Code::BAD_MESSAGE).with_cause(cause)
    }

    pub fn not_found(cause: impl Into<String>) -> Self {
        Self::with_code(Code::NOT_FOUND).with_cause(cause)
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::with_code(Code::INTERNAL_SERVER_ERROR).with_cause(cause)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn cause(&self) -> Option<&str> {
        if self.cause.is_empty() {
            None
        } else {
            Some(&self.cause)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn is_business_error(&self) -> bool {
        self.code.as_i32() > 0 && !self.code.is_framework()
    }

    /// New status with `extra` appended to the cause.
    pub fn copy_with(&self, extra: impl fmt::Display) -> Self {
        let cause = if self.cause.is_empty() {
            extra.to_string()
        } else {
            format!("{}: {}", self.cause, extra)
        };
        Self {
            code: self.code,
            msg: self.msg.clone(),
            cause,
        }
    }

    pub fn to_json(&self) -> String {
        // a struct of one integer and two strings always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(data: &[u8]) -> Result<Self, Status> {
        serde_json::from_slice(data).map_err(|e| Status::bad_message(format!("invalid status: {}", e)))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {} ({})", self.code, self.msg)?;
        if !self.cause.is_empty() {
            write!(f, ": {}", self.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

/// Whether the status reports a broken or unusable transport.
pub fn is_conn_error(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::WRONG_CONN | Code::CONN_CLOSED | Code::WRITE_FAILED | Code::DIAL_FAILED
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let st = Status::new(1, "test error").with_cause("boom");
        assert_eq!(st.to_json(), r#"{"code":1,"msg":"test error","cause":"boom"}"#);

        let back = Status::from_json(st.to_json().as_bytes()).unwrap();
        assert_eq!(back, st);

        let partial = Status::from_json(br#"{"code":404}"#).unwrap();
        assert_eq!(partial.code(), Code::NOT_FOUND);
        assert!(partial.cause().is_none());

        assert!(Status::from_json(b"not json").is_err());
    }

    #[test]
    fn test_ok() {
        assert!(Status::ok().is_ok());
        assert!(Status::default().is_ok());
        assert!(!Status::with_code(Code::BAD_MESSAGE).is_ok());
    }

    #[test]
    fn test_code_text() {
        assert_eq!(Code::CONN_CLOSED.as_str(), "Connection Closed");
        assert_eq!(Code::new(503).as_str(), "Service Unavailable");
        assert_eq!(Code::new(-42).as_str(), "Unknown Error");

        let st = Status::from_code_text(Code::BAD_MESSAGE, "truncated frame", false);
        assert_eq!(st.msg(), "Bad Message");
        assert_eq!(st.cause(), Some("truncated frame"));

        let st = Status::from_code_text(Code::INTERNAL_SERVER_ERROR, "oops", true);
        assert!(st.cause().unwrap().starts_with("oops\n"));
    }

    #[test]
    fn test_copy_with() {
        let st = Status::new(Code::WRITE_FAILED, "write failed");
        let copy = st.copy_with("broken pipe").copy_with("retry");
        assert_eq!(copy.cause(), Some("broken pipe: retry"));
        assert_eq!(copy.code(), st.code());
        assert!(st.cause().is_none());
    }

    #[test]
    fn test_classification() {
        assert!(Status::new(1, "x").is_business_error());
        assert!(Status::new(700, "x").is_business_error());
        assert!(!Status::with_code(Code::NOT_FOUND).is_business_error());
        assert!(!Status::ok().is_business_error());

        assert!(is_conn_error(&Status::conn_closed("eof")));
        assert!(is_conn_error(&Status::dial_failed("refused")));
        assert!(!is_conn_error(&Status::bad_message("bad")));
    }

    #[test]
    fn test_display() {
        let st = Status::not_found("/a/b");
        assert_eq!(st.to_string(), "code 404 (Not Found): /a/b");
    }
}
