use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Container framing is not recognised or points outside the file.
    #[error("format error: {0}")]
    Format(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    /// The pickle stream is malformed, truncated, or refers to a forbidden class.
    #[error("unpickling error at byte {offset}: {message}")]
    Unpickling { offset: usize, message: String },

    #[error("cannot render {node} at {file}:{line}")]
    UnsupportedConstruct {
        node: String,
        file: String,
        line: usize,
    },

    #[error("path escapes extraction root: {}", .0.display())]
    PathSafety(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn unpickling(offset: usize, message: impl Into<String>) -> Self {
        Error::Unpickling {
            offset,
            message: message.into(),
        }
    }

    /// Shape errors found after the opcode stream has been fully read.
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Error::Unpickling {
            offset: 0,
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(node: impl Into<String>, file: &str, line: usize) -> Self {
        Error::UnsupportedConstruct {
            node: node.into(),
            file: file.to_string(),
            line,
        }
    }
}
