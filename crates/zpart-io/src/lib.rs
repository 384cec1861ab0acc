//! ZPart 文件格式处理
//!
//! 支持的格式：
//! - IGES (.iges, .igs) 装配结构，有损
//! - STEP (.step, .stp) 装配结构与网格，无损
//! - BREP (.brep) 原生格式，无损
//! - STL (.stl) 三角网格，ASCII 或二进制
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::path::Path;
//! use zpart_core::registry::DocumentRegistry;
//! use zpart_io::{find_part_format, Io, IoSettings};
//!
//! let io = Io::new(&IoSettings::default());
//! let mut registry = DocumentRegistry::new();
//! let id = registry.add_document("bracket", true);
//! let path = Path::new("bracket.step");
//! io.import_in_document(registry.document_mut(id).unwrap(), find_part_format(path), path, None)?;
//! # Ok::<(), zpart_io::IoError>(())
//! ```

mod codec;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod options;
pub mod progress;

pub use codec::brep::BREP_VERSION;
pub use dispatch::Io;
pub use error::{CodecError, IoError, IoResult};
pub use format::{
    find_part_format, has_export_options_for_format, part_format_filter, part_format_filters,
    part_format_from_filter, part_formats, sniff_part_format, PartFormat,
};
pub use options::{ExportOptions, IoSettings, StlFormat, StlIoLibrary};
pub use progress::{ProgressSink, TaskProgress};
