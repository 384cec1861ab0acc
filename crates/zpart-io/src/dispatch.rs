//! 导入/导出分发
//!
//! `Io` 按格式把一次导入或导出分发给唯一一个编解码器。
//! 它唯一的可变状态是 STL 实现开关，可被多个线程共享。

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zpart_core::model::{ApplicationItem, AssemblyModel};
use zpart_core::shape::ShapeDocument;

use crate::codec::{brep, iges, step, stl};
use crate::error::{CodecError, CodecResult, IoError, IoResult};
use crate::format::PartFormat;
use crate::options::{ExportOptions, IoSettings, StlIoLibrary};
use crate::progress::{Progress, ProgressSink};

/// 导入/导出分发器
#[derive(Debug, Default)]
pub struct Io {
    stl_io_library: AtomicU8,
}

impl Io {
    pub fn new(settings: &IoSettings) -> Self {
        Self {
            stl_io_library: AtomicU8::new(settings.stl_io_library.to_u8()),
        }
    }

    pub fn stl_io_library(&self) -> StlIoLibrary {
        StlIoLibrary::from_u8(self.stl_io_library.load(Ordering::Acquire))
    }

    /// 切换 STL 实现；已经开始的导出不受影响
    pub fn set_stl_io_library(&self, library: StlIoLibrary) {
        self.stl_io_library.store(library.to_u8(), Ordering::Release);
    }

    /// 把文件导入到模型
    ///
    /// 成功时模型树已重建，并为新实体发出 `EntityAdded`；失败或取消时模型保持原样。
    /// `PartFormat::Unknown` 直接返回 `FormatUnresolved`，不会重新嗅探。
    pub fn import_in_document(
        &self,
        model: &mut AssemblyModel,
        format: PartFormat,
        path: &Path,
        progress: Option<&dyn ProgressSink>,
    ) -> IoResult<()> {
        let mut progress = Progress::start(progress);
        let started = Instant::now();
        info!("Importing {} file '{}' into {}", format, path.display(), model.id());

        let result = match format {
            PartFormat::Unknown => {
                return Err(IoError::FormatUnresolved {
                    path: path.to_path_buf(),
                })
            }
            PartFormat::Iges | PartFormat::Step | PartFormat::Brep => model.xcaf_import(|shapes| -> CodecResult<()> {
                let reader = BufReader::new(File::open(path)?);
                match format {
                    PartFormat::Iges => iges::read(reader, shapes, &mut progress),
                    PartFormat::Step => step::read(reader, shapes, &mut progress),
                    _ => brep::read(reader, shapes, &mut progress),
                }
            }),
            PartFormat::Stl => model.single_import(|shapes, label| -> CodecResult<()> {
                let reader = BufReader::new(File::open(path)?);
                let stem = path.file_stem().and_then(|s| s.to_str());
                stl::read(reader, shapes, label, stem, &mut progress)
            }),
        };

        match result {
            Ok(()) => {
                progress.finish();
                if model.file_path().is_none() {
                    model.set_file_path(path);
                }
                info!(
                    "Imported '{}' in {}ms, {} entities",
                    path.display(),
                    started.elapsed().as_millis(),
                    model.entities().len()
                );
                Ok(())
            }
            Err(CodecError::Cancelled) => {
                info!("Import of '{}' cancelled", path.display());
                Err(IoError::Cancelled)
            }
            Err(e) => {
                warn!("Failed to import '{}': {}", path.display(), e);
                Err(IoError::codec(format, path, e))
            }
        }
    }

    /// 导出应用程序项
    ///
    /// 除 STL 直接写出外，目标文件要么被完整替换，要么保持不变。
    /// STL 直接写出在失败时可能留下不完整的文件，但仍然返回错误。
    /// 对没有导出选项的格式，`options` 被忽略。
    pub fn export_application_items(
        &self,
        items: &[ApplicationItem<'_>],
        format: PartFormat,
        options: &ExportOptions,
        path: &Path,
        progress: Option<&dyn ProgressSink>,
    ) -> IoResult<()> {
        // 开关只在操作开始时读取一次
        let stl_library = self.stl_io_library();
        let mut progress = Progress::start(progress);
        let started = Instant::now();
        info!("Exporting {} item(s) as {} to '{}'", items.len(), format, path.display());
        if !format.has_export_options() && *options != ExportOptions::default() {
            debug!("{} has no export options, ignoring them", format);
        }

        let result = match format {
            PartFormat::Unknown => {
                return Err(IoError::FormatUnresolved {
                    path: path.to_path_buf(),
                })
            }
            PartFormat::Iges | PartFormat::Step | PartFormat::Brep => {
                gather_selection(items).and_then(|selection| {
                    let file_name = display_file_name(path);
                    write_atomically(path, |writer| match format {
                        PartFormat::Iges => iges::write(&selection, &file_name, writer, &mut progress),
                        PartFormat::Step => step::write(&selection, &file_name, writer, &mut progress),
                        _ => brep::write(&selection, writer, &mut progress),
                    })
                })
            }
            PartFormat::Stl => gather_selection(items)
                .and_then(|selection| stl::gather_meshes(&selection))
                .and_then(|meshes| match stl_library {
                    StlIoLibrary::Streaming => {
                        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("zpart");
                        write_atomically(path, |writer| {
                            stl::write_streaming(&meshes, options, stem, writer, &mut progress)
                        })
                    }
                    StlIoLibrary::Direct => write_in_place(path, |writer| {
                        stl::write_direct(&meshes, options.stl_format, writer, &mut progress)
                    }),
                }),
        };

        match result {
            Ok(()) => {
                progress.finish();
                info!("Exported '{}' in {}ms", path.display(), started.elapsed().as_millis());
                Ok(())
            }
            Err(CodecError::Cancelled) => {
                info!("Export to '{}' cancelled", path.display());
                Err(IoError::Cancelled)
            }
            Err(e) => {
                warn!("Failed to export '{}': {}", path.display(), e);
                Err(IoError::codec(format, path, e))
            }
        }
    }
}

/// 把导出选择拷贝到一个新的几何文档，选择中的每个形状成为自由形状
fn gather_selection(items: &[ApplicationItem<'_>]) -> CodecResult<ShapeDocument> {
    let mut selection = ShapeDocument::new();
    for item in items {
        selection.copy_shapes_from(item.document.shapes(), &item.labels());
    }
    if selection.free_shapes().is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(selection)
}

fn display_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 写入同目录下的临时文件，成功后原子替换目标
fn write_atomically<F>(path: &Path, write: F) -> CodecResult<()>
where
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> CodecResult<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(&mut temp);
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.persist(path).map_err(|e| CodecError::Io(e.error))?;
    Ok(())
}

/// 直接写目标文件；失败时可能留下不完整的内容
fn write_in_place<F>(path: &Path, write: F) -> CodecResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> CodecResult<()>,
{
    let mut writer = BufWriter::new(File::create(path)?);
    write(&mut writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zpart_core::registry::DocumentRegistry;
    use zpart_core::shape::ShapeType;

    #[test]
    fn test_toggle_is_read_from_settings() {
        let io = Io::default();
        assert_eq!(io.stl_io_library(), StlIoLibrary::Streaming);
        io.set_stl_io_library(StlIoLibrary::Direct);
        assert_eq!(io.stl_io_library(), StlIoLibrary::Direct);

        let settings = IoSettings {
            stl_io_library: StlIoLibrary::Direct,
            ..Default::default()
        };
        assert_eq!(Io::new(&settings).stl_io_library(), StlIoLibrary::Direct);
    }

    #[test]
    fn test_unknown_format_is_unresolved() {
        let mut registry = DocumentRegistry::new();
        let id = registry.add_document("doc", true);
        let model = registry.document_mut(id).unwrap();
        let io = Io::default();

        let err = io
            .import_in_document(model, PartFormat::Unknown, Path::new("part.xyz"), None)
            .unwrap_err();
        assert!(matches!(err, IoError::FormatUnresolved { .. }));

        let err = io
            .export_application_items(
                &[ApplicationItem::document(model)],
                PartFormat::Unknown,
                &ExportOptions::default(),
                Path::new("out.xyz"),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, IoError::FormatUnresolved { .. }));
    }

    #[test]
    fn test_missing_file_is_a_codec_error() {
        let mut registry = DocumentRegistry::new();
        let id = registry.add_document("doc", true);
        let model = registry.document_mut(id).unwrap();

        let err = Io::default()
            .import_in_document(model, PartFormat::Step, Path::new("/no/such/file.step"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            IoError::Codec {
                format: PartFormat::Step,
                source: CodecError::Io(_),
                ..
            }
        ));
        assert!(model.shapes().is_empty());
        assert!(model.file_path().is_none());
    }

    #[test]
    fn test_empty_selection_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("empty.step");
        let mut registry = DocumentRegistry::new();
        let id = registry.add_document("doc", true);
        let model = registry.document(id).unwrap();

        let err = Io::default()
            .export_application_items(
                &[ApplicationItem::document(model)],
                PartFormat::Step,
                &ExportOptions::default(),
                &target,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, IoError::Codec { source: CodecError::Empty, .. }));
        assert!(!target.exists());
    }

    #[test]
    fn test_export_single_node() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("one.brep");
        let mut registry = DocumentRegistry::new();
        let id = registry.add_document("doc", true);
        let model = registry.document_mut(id).unwrap();
        model
            .xcaf_import(|shapes| -> Result<(), CodecError> {
                shapes.add_part(Some("a".into()), ShapeType::Solid, None);
                shapes.add_part(Some("b".into()), ShapeType::Solid, None);
                Ok(())
            })
            .unwrap();
        let second = model.entities()[1];

        let io = Io::default();
        io.export_application_items(
            &[ApplicationItem::node(model, second)],
            PartFormat::Brep,
            &ExportOptions::default(),
            &target,
            None,
        )
        .unwrap();

        let other = registry.add_document("copy", true);
        let copy = registry.document_mut(other).unwrap();
        io.import_in_document(copy, PartFormat::Brep, &target, None).unwrap();
        let entities = copy.entities();
        assert_eq!(entities.len(), 1);
        assert_eq!(copy.node_name(entities[0]), "b");
        assert_eq!(copy.file_path(), Some(target.as_path()));
    }
}
