//! 导入/导出错误定义

use crate::format::PartFormat;
use std::path::PathBuf;
use thiserror::Error;
use zpart_core::shape::ShapeError;

/// 导入/导出操作结果
pub type IoResult<T> = Result<T, IoError>;

/// 编解码器内部结果
pub type CodecResult<T> = Result<T, CodecError>;

/// 编解码器错误
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid structure: {0}")]
    Shape(#[from] ShapeError),

    #[error("Nothing to export")]
    Empty,

    #[error("Cancelled")]
    Cancelled,
}

impl CodecError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        CodecError::Parse {
            line,
            message: message.into(),
        }
    }
}

/// 导入/导出操作错误
///
/// 三类错误都是可恢复的：目标文档或文件保持操作前的状态（或完整完成）。
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Unable to resolve part format of '{}'", path.display())]
    FormatUnresolved { path: PathBuf },

    #[error("{format} codec failed on '{}': {source}", path.display())]
    Codec {
        format: PartFormat,
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl IoError {
    /// 包装编解码器错误；取消被提升为 `IoError::Cancelled`
    pub fn codec(format: PartFormat, path: impl Into<PathBuf>, source: CodecError) -> Self {
        match source {
            CodecError::Cancelled => IoError::Cancelled,
            source => IoError::Codec {
                format,
                path: path.into(),
                source,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IoError::Cancelled)
    }
}
