//! Error types for cmdtab using thiserror

use thiserror::Error;

/// Top-level error type for table generation
#[derive(Error, Debug)]
pub enum CmdtabError {
    #[error("module {0} has no commands")]
    EmptyModule(String),

    #[error("command ranges overlap: {first} ({first_base}..={first_end}) and {second} ({second_base}..={second_end})")]
    Overlap {
        first: String,
        first_base: u32,
        first_end: u32,
        second: String,
        second_base: u32,
        second_end: u32,
    },

    #[error("fingerprint mismatch: expected {expected}, table has {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
