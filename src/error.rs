use thiserror::Error;

/// Errors raised by compilation and evaluation.
///
/// `Type` is the only *static* error: it is raised while a clause or
/// expression is being compiled (constant folded) and is the class of error
/// that compile-error recovery may defer to runtime. All other variants are
/// *dynamic*: they surface while results are being pulled and always
/// propagate to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Type error: {0}")]
    Type(String),
    #[error("Dynamic type error: {0}")]
    DynamicType(String),
    #[error("Unknown variable: ${0}")]
    UnknownVariable(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("No context item is bound")]
    NoContext,
    #[error("Query cancelled")]
    Cancelled,
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether this error belongs to the static (compile-time) class.
    pub fn is_static(&self) -> bool {
        matches!(self, EngineError::Type(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
