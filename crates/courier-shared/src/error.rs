use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}
