//! Runtime error channel shared by the VM, the object model, and natives.
//!
//! Compile-time diagnostics live in [`crate::diagnostics`]; this module only
//! covers errors raised while bytecode is executing.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result alias for anything that can raise a Grace runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// The closed set of runtime error kinds.
///
/// These are the conditions a `catch` block can observe; the variant name is
/// also what `typename`-style diagnostics print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ExcKind {
    AssertionFailed,
    FileWriteFailed,
    FunctionNotExported,
    FunctionNotFound,
    IncorrectArgCount,
    IndexOutOfRange,
    InvalidArgument,
    InvalidCast,
    InvalidCollectionOperation,
    InvalidIterator,
    InvalidOperand,
    InvalidType,
    KeyNotFound,
    MemberNotFound,
    NamespaceNotFound,
    ThrownException,
}

impl ExcKind {
    /// Human-readable phrase used when an exception is printed.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::AssertionFailed => "Assertion failed",
            Self::FileWriteFailed => "File write failed",
            Self::FunctionNotExported => "Function not exported",
            Self::FunctionNotFound => "Function not found",
            Self::IncorrectArgCount => "Incorrect argument count",
            Self::IndexOutOfRange => "Index out of range",
            Self::InvalidArgument => "Invalid argument",
            Self::InvalidCast => "Invalid cast",
            Self::InvalidCollectionOperation => "Invalid collection operation",
            Self::InvalidIterator => "Invalid iterator",
            Self::InvalidOperand => "Invalid operand",
            Self::InvalidType => "Invalid type",
            Self::KeyNotFound => "Key not found",
            Self::MemberNotFound => "Member not found",
            Self::NamespaceNotFound => "Namespace not found",
            Self::ThrownException => "Thrown exception",
        }
    }
}

/// A runtime exception: a kind tag plus a message.
///
/// This is both the error type carried through `RunResult` and the payload of
/// a heap `Exception` object once an error is caught or `throw`n.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceError {
    pub kind: ExcKind,
    pub message: String,
}

impl GraceError {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_operand(message: impl Into<String>) -> Self {
        Self::new(ExcKind::InvalidOperand, message)
    }

    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self::new(ExcKind::InvalidType, message)
    }

    pub fn invalid_cast(message: impl Into<String>) -> Self {
        Self::new(ExcKind::InvalidCast, message)
    }

    pub fn index_out_of_range(message: impl Into<String>) -> Self {
        Self::new(ExcKind::IndexOutOfRange, message)
    }

    pub fn key_not_found(message: impl Into<String>) -> Self {
        Self::new(ExcKind::KeyNotFound, message)
    }
}

impl fmt::Display for GraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)
    }
}

/// What can stop the run loop besides a normal `Exit`.
///
/// `Error` is catchable by `try`/`catch`; `Exit` is the `__NATIVE_SYSTEM_EXIT`
/// channel and unwinds unconditionally.
#[derive(Debug)]
pub enum RunError {
    Error(GraceError),
    Exit(i64),
}

impl From<GraceError> for RunError {
    fn from(err: GraceError) -> Self {
        Self::Error(err)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => err.fmt(f),
            Self::Exit(code) => write!(f, "exit({code})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_kind_phrase_and_message() {
        let err = GraceError::new(ExcKind::ThrownException, "boom");
        assert_eq!(err.to_string(), "Thrown exception: boom");
    }

    #[test]
    fn kind_name_matches_variant() {
        let name: &'static str = ExcKind::KeyNotFound.into();
        assert_eq!(name, "KeyNotFound");
        assert_eq!(ExcKind::KeyNotFound.to_string(), "KeyNotFound");
    }
}
