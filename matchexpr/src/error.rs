use thiserror::Error;

/// Error type shared by the tokenizer, parser and evaluator.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("unknown property '{0}'")]
    Property(String),

    #[error("{function}: expected {expected} arguments, got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("{function}: {message}")]
    Function { function: String, message: String },

    #[error("eval() recursion depth exceeded")]
    Depth,
}

impl Error {
    /// Shorthand for a failure raised inside a registered function.
    pub fn function(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Function {
            function: name.into(),
            message: message.into(),
        }
    }
}
