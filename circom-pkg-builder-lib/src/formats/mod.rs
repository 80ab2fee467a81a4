//! Readers for the binary artifacts the pipeline has to trust: the compiled
//! constraint system (`.r1cs`) and proving keys (`.zkey`).

pub mod binfile;
pub mod r1cs;
pub mod zkey;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unexpected end of input while reading {field} at offset {offset}")]
    UnexpectedEnd { field: &'static str, offset: usize },

    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: String, found: String },

    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),

    #[error("missing section {0}")]
    MissingSection(u32),

    #[error("invalid {field}: {detail}")]
    InvalidValue { field: &'static str, detail: String },

    #[error("{field} mismatch: circuit has {expected}, key declares {found}")]
    Inconsistent {
        field: &'static str,
        expected: String,
        found: String,
    },
}

impl From<FormatError> for crate::error::Error {
    fn from(e: FormatError) -> Self {
        crate::error::Error::Format(e.to_string())
    }
}
