//! STL 网格
//!
//! 读取 ASCII 和二进制两种编码，结果放入导入时新建的简单形状。
//! 写出有两种实现，见 `StlIoLibrary`。

use std::io::{Read, Write};

use nalgebra::{Isometry3, Point3};
use tracing::debug;
use zpart_core::mesh::{facet_normal, TriangleMesh};
use zpart_core::shape::{LabelId, ShapeDocument};

use crate::error::{CodecError, CodecResult};
use crate::format::is_binary_stl;
use crate::options::{ExportOptions, StlFormat};
use crate::progress::Progress;

const HEADER_LEN: usize = 80;
const FACET_LEN: usize = 50;
/// 每处理这么多三角形上报一次进度
const CHUNK_FACETS: usize = 4096;
/// 每处理这么多行上报一次进度
const CHUNK_LINES: usize = 8192;

const BINARY_HEADER: &[u8] = b"zpart binary STL";
const DIRECT_SOLID_NAME: &str = "zpart";

// ========== 读取 ==========

/// 读取 STL 到 `label` 指向的简单形状
///
/// 形状名取自 ASCII 实体名，没有时取 `fallback_name`。
pub(crate) fn read<R: Read>(
    mut reader: R,
    shapes: &mut ShapeDocument,
    label: LabelId,
    fallback_name: Option<&str>,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    progress.check()?;

    let (mesh, solid_name) = if is_binary_stl(&data, data.len() as u64) {
        (read_binary(&data, progress)?, None)
    } else if data.trim_ascii_start().starts_with(b"solid") {
        let text = std::str::from_utf8(&data)
            .map_err(|_| CodecError::InvalidContent("ASCII STL is not valid UTF-8".into()))?;
        read_ascii(text, progress)?
    } else {
        return Err(CodecError::InvalidContent(
            "neither ASCII STL nor a binary STL of consistent length".into(),
        ));
    };

    debug!("STL: {} triangles", mesh.triangle_count());
    let name = solid_name
        .filter(|s| !s.is_empty())
        .or_else(|| fallback_name.map(str::to_string));
    if let Some(name) = name {
        shapes.set_name(label, name);
    }
    shapes.set_mesh(label, mesh)?;
    Ok(())
}

fn read_binary(data: &[u8], progress: &mut Progress<'_>) -> CodecResult<TriangleMesh> {
    let count = u32::from_le_bytes([data[80], data[81], data[82], data[83]]) as usize;
    let mut mesh = TriangleMesh::new();
    mesh.vertices.reserve(count * 3);
    mesh.triangles.reserve(count);

    for (index, facet) in data[HEADER_LEN + 4..].chunks_exact(FACET_LEN).enumerate() {
        // 跳过 12 字节法向，末尾 2 字节属性忽略
        let vertex = |n: usize| {
            let at = 12 + n * 12;
            Point3::new(
                f64::from(le_f32(&facet[at..])),
                f64::from(le_f32(&facet[at + 4..])),
                f64::from(le_f32(&facet[at + 8..])),
            )
        };
        let [a, b, c] = [vertex(0), vertex(1), vertex(2)];
        if ![a, b, c].iter().all(|p| p.coords.iter().all(|v| v.is_finite())) {
            return Err(CodecError::InvalidContent(format!("facet {index} has a non-finite vertex")));
        }
        mesh.push_triangle(a, b, c);
        if (index + 1) % CHUNK_FACETS == 0 {
            progress.step(index + 1, count)?;
        }
    }
    Ok(mesh)
}

fn le_f32(bytes: &[u8]) -> f32 {
    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_ascii(text: &str, progress: &mut Progress<'_>) -> CodecResult<(TriangleMesh, Option<String>)> {
    let mut mesh = TriangleMesh::new();
    let mut solid_name = None;
    let mut pending: Vec<Point3<f64>> = Vec::with_capacity(3);
    let total_lines = text.lines().count();

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let mut words = line.split_whitespace();
        match words.next() {
            None | Some("facet") | Some("outer") | Some("endloop") | Some("endsolid") => {}
            Some("solid") => {
                let name = words.collect::<Vec<_>>().join(" ");
                solid_name.get_or_insert(name);
            }
            Some("vertex") => {
                let mut coords = [0.0; 3];
                for slot in &mut coords {
                    *slot = words
                        .next()
                        .and_then(|w| w.parse::<f64>().ok())
                        .filter(|v| v.is_finite())
                        .ok_or_else(|| CodecError::parse(line_no, "invalid vertex"))?;
                }
                if pending.len() == 3 {
                    return Err(CodecError::parse(line_no, "more than three vertices in facet"));
                }
                pending.push(Point3::new(coords[0], coords[1], coords[2]));
            }
            Some("endfacet") => {
                let [a, b, c] = pending[..] else {
                    return Err(CodecError::parse(line_no, "facet without three vertices"));
                };
                mesh.push_triangle(a, b, c);
                pending.clear();
            }
            Some(other) => {
                return Err(CodecError::parse(line_no, format!("unexpected keyword '{other}'")));
            }
        }
        if line_no % CHUNK_LINES == 0 {
            progress.step(line_no, total_lines)?;
        }
    }
    if !pending.is_empty() {
        return Err(CodecError::InvalidContent("unterminated facet".into()));
    }
    Ok((mesh, solid_name))
}

// ========== 写出 ==========

/// 选择中所有网格，变换到世界坐标，按自由形状顺序
pub(crate) fn gather_meshes(shapes: &ShapeDocument) -> CodecResult<Vec<TriangleMesh>> {
    let mut collected = Vec::new();
    for root in shapes.free_shapes() {
        shapes.collect_meshes(root, &Isometry3::identity(), &mut collected);
    }
    let meshes: Vec<TriangleMesh> = collected
        .into_iter()
        .map(|(_, mesh)| mesh)
        .filter(|mesh| !mesh.is_empty())
        .collect();
    if meshes.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(meshes)
}

/// 流式写出：逐个网格输出，支持实体名和精度选项
pub(crate) fn write_streaming<W: Write>(
    meshes: &[TriangleMesh],
    options: &ExportOptions,
    default_solid_name: &str,
    mut writer: W,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    let total: usize = meshes.iter().map(TriangleMesh::triangle_count).sum();
    let mut done = 0;
    match options.stl_format {
        StlFormat::Ascii => {
            let name = if options.stla_solid_name.is_empty() {
                default_solid_name
            } else {
                options.stla_solid_name.as_str()
            };
            // 有效位数 = 小数位 + 1
            let decimals = usize::from(options.stla_float_precision.clamp(1, 17)) - 1;
            writeln!(writer, "solid {name}")?;
            for mesh in meshes {
                for facet in mesh.facets() {
                    write_ascii_facet(&mut writer, &facet, |v| format!("{v:.decimals$e}"))?;
                    done += 1;
                    if done % CHUNK_FACETS == 0 {
                        progress.step(done, total)?;
                    }
                }
            }
            writeln!(writer, "endsolid {name}")?;
        }
        StlFormat::Binary => {
            write_binary_header(&mut writer, total)?;
            for mesh in meshes {
                for facet in mesh.facets() {
                    write_binary_facet(&mut writer, &facet)?;
                    done += 1;
                    if done % CHUNK_FACETS == 0 {
                        progress.step(done, total)?;
                    }
                }
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// 直接写出：先合并为一个网格再一次输出；实体名固定，坐标使用最短表示
pub(crate) fn write_direct<W: Write>(
    meshes: &[TriangleMesh],
    format: StlFormat,
    mut writer: W,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    let mut merged = TriangleMesh::new();
    for mesh in meshes {
        merged.append(mesh);
    }
    progress.set(50);
    progress.check()?;

    match format {
        StlFormat::Ascii => {
            writeln!(writer, "solid {DIRECT_SOLID_NAME}")?;
            for facet in merged.facets() {
                write_ascii_facet(&mut writer, &facet, |v| format!("{v:e}"))?;
            }
            writeln!(writer, "endsolid {DIRECT_SOLID_NAME}")?;
        }
        StlFormat::Binary => {
            write_binary_header(&mut writer, merged.triangle_count())?;
            for facet in merged.facets() {
                write_binary_facet(&mut writer, &facet)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_ascii_facet<W: Write>(
    writer: &mut W,
    facet: &[Point3<f64>; 3],
    real: impl Fn(f64) -> String,
) -> CodecResult<()> {
    let n = facet_normal(facet);
    writeln!(writer, "  facet normal {} {} {}", real(n.x), real(n.y), real(n.z))?;
    writeln!(writer, "    outer loop")?;
    for v in facet {
        writeln!(writer, "      vertex {} {} {}", real(v.x), real(v.y), real(v.z))?;
    }
    writeln!(writer, "    endloop")?;
    writeln!(writer, "  endfacet")?;
    Ok(())
}

fn write_binary_header<W: Write>(writer: &mut W, count: usize) -> CodecResult<()> {
    let count = u32::try_from(count)
        .map_err(|_| CodecError::InvalidContent(format!("{count} triangles exceed binary STL limit")))?;
    let mut header = [0u8; HEADER_LEN];
    header[..BINARY_HEADER.len()].copy_from_slice(BINARY_HEADER);
    writer.write_all(&header)?;
    writer.write_all(&count.to_le_bytes())?;
    Ok(())
}

fn write_binary_facet<W: Write>(writer: &mut W, facet: &[Point3<f64>; 3]) -> CodecResult<()> {
    let n = facet_normal(facet);
    let mut record = [0u8; FACET_LEN];
    let values = [n.x, n.y, n.z]
        .into_iter()
        .chain(facet.iter().flat_map(|v| [v.x, v.y, v.z]));
    for (i, value) in values.enumerate() {
        record[i * 4..i * 4 + 4].copy_from_slice(&(value as f32).to_le_bytes());
    }
    writer.write_all(&record)?;
    Ok(())
}
