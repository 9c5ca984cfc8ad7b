//! The runtime exception object: what a `catch` block binds and what
//! `Exception(x)` constructs.

use crate::error::{ExcKind, GraceError};

#[derive(Debug)]
pub struct ExceptionObj {
    kind: ExcKind,
    message: String,
}

impl ExceptionObj {
    #[must_use]
    pub fn new(kind: ExcKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub fn display(&self) -> String {
        format!("{}: {}", self.kind.description(), self.message)
    }

    /// Converts back to the error channel when the object is re-`throw`n.
    #[must_use]
    pub fn to_error(&self) -> GraceError {
        GraceError::new(self.kind, self.message.clone())
    }
}

impl From<GraceError> for ExceptionObj {
    fn from(err: GraceError) -> Self {
        Self::new(err.kind, err.message)
    }
}
