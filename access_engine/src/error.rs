use thiserror::Error;

/// Error kinds surfaced by the engine. Every fallible operation returns one
/// of these; nothing is swallowed. An enforcement call that fails denies the
/// request and hands the error to the caller so policy-driven denies can be
/// told apart from failure-driven ones.
#[derive(Debug, Error)]
pub enum Error {
    /// Model syntax, key-prefix mismatch or unknown section tag.
    #[error("invalid model configuration: {0}")]
    Config(String),

    /// A name that should resolve to a definition does not.
    #[error("unknown reference: {0}")]
    Reference(String),

    /// A matcher expression failed to compile.
    #[error("matcher compile error: {0}")]
    Compile(String),

    /// Malformed arguments: wrong arity or type for a matching function, or
    /// a request tuple shorter than its definition.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Storage adapter failure, surfaced unchanged.
    #[error("adapter error: {0}")]
    Adapter(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The effect expression is not one of the three canonical forms.
    #[error("unsupported effect expression: {0}")]
    UnsupportedEffect(String),
}

impl Error {
    pub fn adapter(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Adapter(err.into())
    }
}

impl From<matchexpr::Error> for Error {
    fn from(err: matchexpr::Error) -> Self {
        match err {
            matchexpr::Error::Arity { .. }
            | matchexpr::Error::Function { .. }
            | matchexpr::Error::Type(_) => Error::Argument(err.to_string()),
            matchexpr::Error::Parse(_) | matchexpr::Error::UnknownFunction(_) => {
                Error::Compile(err.to_string())
            }
            other => Error::Argument(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
