use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("missing weight tensor: {0}")]
    WeightMissing(String),
    #[error("unsupported dtype {dtype} for tensor '{tensor}'")]
    DtypeUnsupported { tensor: String, dtype: String },
    #[error("shape mismatch for tensor '{tensor}': expected {expected} elements, got {got}")]
    ShapeMismatch {
        tensor: String,
        expected: usize,
        got: usize,
    },
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
