//! Status codes and outcome classification
//!
//! A [`Status`] is what a failed call reports to the client. Interceptors use
//! [`Classify`] to turn any call error into a [`Code`] for their records,
//! without changing the error itself.
use std::{error, fmt};

use serde::{Deserialize, Serialize};

/// The closed set of status codes a call can end with.
///
/// The numbering matches the gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Code {
    /// The call completed successfully.
    Ok = 0,
    /// The call was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error, e.g. an error that carries no status.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the call could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity that a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the call.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the call.
    FailedPrecondition = 9,
    /// The call was aborted.
    Aborted = 10,
    /// The call was attempted past the valid range.
    OutOfRange = 11,
    /// The call is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Numeric value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Convert a numeric value to a code, mapping out of range values to [`Code::Unknown`].
    pub fn from_i32(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error status of a call, sent to the client as the final frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Create a new status with the given code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The code of this status
    pub fn code(&self) -> Code {
        self.code
    }

    /// The message of this status
    pub fn message(&self) -> &str {
        &self.message
    }

    /// [`Code::Cancelled`]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// [`Code::Unknown`]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    /// [`Code::InvalidArgument`]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// [`Code::DeadlineExceeded`]
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// [`Code::NotFound`]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// [`Code::Internal`]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// [`Code::Unavailable`]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error: code = {} desc = {}", self.code, self.message)
    }
}

impl error::Error for Status {}

/// Errors that can be classified into a [`Code`].
///
/// Classification is for records only. The classified error is always passed
/// on unchanged.
pub trait Classify: fmt::Display {
    /// The code this error maps to.
    fn code(&self) -> Code;
}

impl Classify for Status {
    fn code(&self) -> Code {
        self.code
    }
}

/// Errors without a status of their own are [`Code::Unknown`], unless a
/// [`Status`] is found in the chain of causes.
impl Classify for anyhow::Error {
    fn code(&self) -> Code {
        self.chain()
            .find_map(|cause| cause.downcast_ref::<Status>())
            .map(Status::code)
            .unwrap_or(Code::Unknown)
    }
}

impl<E: Classify + ?Sized> Classify for Box<E> {
    fn code(&self) -> Code {
        (**self).code()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn code_roundtrips_through_i32() {
        for value in 0..=16 {
            assert_eq!(Code::from_i32(value).as_i32(), value);
        }
        assert_eq!(Code::from_i32(17), Code::Unknown);
        assert_eq!(Code::from_i32(-1), Code::Unknown);
    }

    #[test]
    fn status_display() {
        let status = Status::deadline_exceeded("context deadline exceeded");
        assert_eq!(
            status.to_string(),
            "rpc error: code = DeadlineExceeded desc = context deadline exceeded"
        );
    }

    #[test]
    fn classify_anyhow() {
        let plain = anyhow::anyhow!("EOF");
        assert_eq!(plain.code(), Code::Unknown);

        let wrapped = Err::<(), _>(Status::not_found("no such user"))
            .context("lookup failed")
            .unwrap_err();
        assert_eq!(wrapped.code(), Code::NotFound);
    }
}
