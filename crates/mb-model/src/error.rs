use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),
    #[error("missing metadata key: {0}")]
    MissingKey(String),
    #[error("type mismatch for key '{key}': expected {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: String,
        got: String,
    },
    #[error("unsupported type ID: {0}")]
    UnsupportedType(u32),
    #[error("tensor not found: {0}")]
    TensorNotFound(String),
    #[error("tensor '{name}' has wrong shape: expected {expected}, got {got}")]
    TensorShape {
        name: String,
        expected: String,
        got: String,
    },
    #[error("truncated model file: {0}")]
    Truncated(String),
    #[error("corrupt model file: {0}")]
    Corrupt(String),
    #[error("invalid hyperparameters: {0}")]
    InvalidHparams(String),
    #[error("invalid graph parameters: {0}")]
    InvalidGraphParams(String),
    #[error("{0} model is already initialized")]
    AlreadyInitialized(&'static str),
    #[error("{0} model is not initialized")]
    NotInitialized(&'static str),
    #[error("graph error: {0}")]
    Graph(#[from] mb_graph::GraphError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
