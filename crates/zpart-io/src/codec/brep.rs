//! 原生 BREP 格式
//!
//! 一行魔数和版本号，随后是整个几何文档的 JSON。无损。

use std::io::{Read, Write};

use tracing::debug;
use zpart_core::shape::ShapeDocument;

use crate::error::{CodecError, CodecResult};
use crate::format::BREP_MAGIC;
use crate::progress::Progress;

/// 当前格式版本
pub const BREP_VERSION: u32 = 1;

/// 读取 BREP，将其中的自由形状按顺序拷贝到 `shapes`
pub(crate) fn read<R: Read>(
    mut reader: R,
    shapes: &mut ShapeDocument,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    progress.check()?;

    let (header, body) = content.split_once('\n').unwrap_or((content.as_str(), ""));
    let version = header
        .trim_end()
        .strip_prefix(BREP_MAGIC)
        .map(str::trim)
        .ok_or_else(|| CodecError::InvalidContent("missing BREP header".into()))?;
    match version.parse::<u32>() {
        Ok(BREP_VERSION) => {}
        _ => return Err(CodecError::UnsupportedVersion(version.to_string())),
    }

    let source: ShapeDocument = serde_json::from_str(body)?;
    source.validate()?;
    progress.set(50);
    progress.check()?;

    let roots = source.free_shapes();
    let copied = shapes.copy_shapes_from(&source, &roots);
    debug!("BREP: {} labels, {} free shapes", source.len(), copied.len());
    Ok(())
}

/// 写出整个几何文档
pub(crate) fn write<W: Write>(
    shapes: &ShapeDocument,
    mut writer: W,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    progress.check()?;
    writeln!(writer, "{BREP_MAGIC} {BREP_VERSION}")?;
    serde_json::to_writer(&mut writer, shapes)?;
    writeln!(writer)?;
    writer.flush()?;
    progress.set(100);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{describe, sample_document};
    use nalgebra::Isometry3;
    use zpart_core::shape::ShapeError;

    #[test]
    fn test_round_trip_preserves_structure() {
        let (source, _) = sample_document();
        let mut bytes = Vec::new();
        write(&source, &mut bytes, &mut Progress::start(None)).unwrap();

        let mut target = ShapeDocument::new();
        read(bytes.as_slice(), &mut target, &mut Progress::start(None)).unwrap();
        assert_eq!(describe(&target), describe(&source));
    }

    #[test]
    fn test_read_appends_to_existing_document() {
        let (source, _) = sample_document();
        let mut bytes = Vec::new();
        write(&source, &mut bytes, &mut Progress::start(None)).unwrap();

        let mut target = ShapeDocument::new();
        target.add_part(Some("existing".into()), zpart_core::shape::ShapeType::Solid, None);
        read(bytes.as_slice(), &mut target, &mut Progress::start(None)).unwrap();
        assert_eq!(target.free_shapes().len(), 1 + source.free_shapes().len());
    }

    #[test]
    fn test_rejects_bad_header_and_version() {
        let mut shapes = ShapeDocument::new();
        let err = read(&b"{}"[..], &mut shapes, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidContent(_)));

        let err = read(&b"ZPART-BREP 7\n{}"[..], &mut shapes, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(v) if v == "7"));

        let err = read(&b"ZPART-BREP 1\n{ not json"[..], &mut shapes, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn test_cycle_below_first_assembly_is_rejected() {
        let mut source = ShapeDocument::new();
        let a = source.add_assembly(Some("a".into()));
        let b = source.add_assembly(Some("b".into()));
        let c = source.add_assembly(Some("c".into()));
        source.add_component(a, b, Isometry3::identity(), None).unwrap();
        source.add_component(b, c, Isometry3::identity(), None).unwrap();

        // 在 JSON 中追加 c -> b 的组件
        let mut json = serde_json::to_value(&source).unwrap();
        let labels = json["labels"].as_array_mut().unwrap();
        let mut back = labels[4].clone();
        back["father"] = c.0.into();
        back["kind"]["Reference"]["referred"] = b.0.into();
        labels.push(back);
        let back_id = labels.len() as u32;
        labels[2]["kind"]["Assembly"]["components"]
            .as_array_mut()
            .unwrap()
            .push(back_id.into());
        let text = format!("{BREP_MAGIC} {BREP_VERSION}\n{json}");

        let mut target = ShapeDocument::new();
        let err = read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap_err();
        assert!(
            matches!(err, CodecError::Shape(ShapeError::ReferenceCycle { .. })),
            "{err:?}"
        );
        assert!(target.is_empty());
    }
}
