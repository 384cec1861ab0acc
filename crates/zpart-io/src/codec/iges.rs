//! IGES 装配结构
//!
//! 固定 80 列记录，分 S/G/D/P/T 五段。装配用子图定义（实体 308）和
//! 子图实例（实体 408）表示：
//!
//! - 308：`308,深度,名称,N,DE1,...,DEN;`，深度 0 为零件，大于 0 为装配，
//!   DE 指向该装配的 408 实例
//! - 408：`408,DE,X,Y,Z,S;`，以平移和比例放置一个 308
//!
//! 该格式是有损的：网格、子形状、旋转和组件名称不会写出，名称只保留 ASCII。

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};

use nalgebra::Isometry3;
use tracing::{debug, warn};
use zpart_core::shape::{LabelId, LabelKind, ShapeDocument, ShapeType};

use super::assembly_depth;
use crate::error::{CodecError, CodecResult};
use crate::progress::Progress;

const SUBFIGURE_DEFINITION: u32 = 308;
const SUBFIGURE_INSTANCE: u32 = 408;

/// 数据列宽（第 73 列为段标识，74-80 列为序号）
const DATA_COLUMNS: usize = 72;
/// 参数段数据列宽（65-72 列为目录项指针）
const PARAM_COLUMNS: usize = 64;

// ========== 写出 ==========

/// 一个待写出的实体
struct OutEntity {
    entity_type: u32,
    params: String,
}

pub(crate) fn write<W: Write>(
    shapes: &ShapeDocument,
    file_name: &str,
    mut writer: W,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    // 先编号：所有顶层形状的 308，然后是所有组件的 408
    let roots: Vec<LabelId> = shapes
        .labels()
        .filter(|(_, l)| matches!(l.kind, LabelKind::Assembly { .. } | LabelKind::Simple { .. }))
        .map(|(id, _)| id)
        .collect();
    let components: Vec<LabelId> = roots
        .iter()
        .flat_map(|root| shapes.components(*root).iter().copied())
        .collect();
    if components.iter().any(|c| has_rotation(&shapes.location(*c))) {
        warn!("IGES: component rotations are not exported");
    }

    // 目录项指针 = 第一行的序号
    let directory_pointer = |index: usize| 2 * index + 1;
    let mut pointers = HashMap::new();
    for (index, label) in roots.iter().chain(&components).enumerate() {
        pointers.insert(*label, directory_pointer(index));
    }
    let pointer = |label: LabelId| -> CodecResult<usize> {
        pointers
            .get(&label)
            .copied()
            .ok_or_else(|| CodecError::InvalidContent(format!("dangling label {label}")))
    };

    let mut entities = Vec::with_capacity(roots.len() + components.len());
    for root in &roots {
        let name = hollerith(&sanitize(shapes.name(*root).unwrap_or_default()));
        let members = shapes
            .components(*root)
            .iter()
            .map(|c| pointer(*c).map(|p| format!(",{p}")))
            .collect::<CodecResult<String>>()?;
        entities.push(OutEntity {
            entity_type: SUBFIGURE_DEFINITION,
            params: format!(
                "{},{},{},{}{};",
                SUBFIGURE_DEFINITION,
                assembly_depth(shapes, *root),
                name,
                shapes.components(*root).len(),
                members
            ),
        });
    }
    for component in &components {
        let t = shapes.location(*component).translation.vector;
        entities.push(OutEntity {
            entity_type: SUBFIGURE_INSTANCE,
            params: format!(
                "{},{},{:?},{:?},{:?},1.0;",
                SUBFIGURE_INSTANCE,
                pointer(shapes.referred(*component))?,
                t.x,
                t.y,
                t.z
            ),
        });
    }

    // S 段
    let start_lines = write_section(&mut writer, 'S', "ZPart IGES assembly export", DATA_COLUMNS)?;

    // G 段
    let timestamp = chrono::Utc::now().format("%Y%m%d.%H%M%S").to_string();
    let global = format!(
        "1H,,1H;,{},{},{},{},{};",
        hollerith("ZPart"),
        hollerith(&sanitize(file_name)),
        hollerith("zpart"),
        hollerith(env!("CARGO_PKG_VERSION")),
        hollerith(&timestamp)
    );
    let global_lines = write_section(&mut writer, 'G', &global, DATA_COLUMNS)?;

    // P 段先排版，D 段需要参数行号
    let mut param_lines: Vec<(usize, String)> = Vec::new();
    let mut param_spans = Vec::with_capacity(entities.len());
    for (index, entity) in entities.iter().enumerate() {
        let first = param_lines.len() + 1;
        for chunk in chunks(&entity.params, PARAM_COLUMNS) {
            param_lines.push((directory_pointer(index), chunk.to_string()));
        }
        param_spans.push((first, param_lines.len() + 1 - first));
    }

    // D 段
    let total = entities.len();
    for (index, entity) in entities.iter().enumerate() {
        let (first, count) = param_spans[index];
        let seq = directory_pointer(index);
        writeln!(
            writer,
            "{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}D{:>7}",
            entity.entity_type, first, 0, 0, 0, 0, 0, 0, "00000000", seq
        )?;
        writeln!(
            writer,
            "{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}{:>8}D{:>7}",
            entity.entity_type, 0, 0, count, 0, "", "", "", 0, seq + 1
        )?;
        progress.step(index + 1, 2 * total)?;
    }

    // P 段
    for (seq, (de, text)) in param_lines.iter().enumerate() {
        writeln!(writer, "{:<64}{:>8}P{:>7}", text, de, seq + 1)?;
    }
    progress.check()?;

    // T 段
    let terminate = format!(
        "S{:>7}G{:>7}D{:>7}P{:>7}",
        start_lines,
        global_lines,
        2 * total,
        param_lines.len()
    );
    writeln!(writer, "{:<72}T{:>7}", terminate, 1)?;
    writer.flush()?;
    Ok(())
}

fn write_section<W: Write>(writer: &mut W, section: char, text: &str, width: usize) -> CodecResult<usize> {
    let mut count = 0;
    for chunk in chunks(text, width) {
        count += 1;
        writeln!(writer, "{chunk:<width$}{section}{count:>7}")?;
    }
    Ok(count)
}

/// 按固定宽度切分（调用方保证 ASCII）
fn chunks(text: &str, width: usize) -> impl Iterator<Item = &str> {
    let bytes = text.as_bytes();
    (0..bytes.len().max(1))
        .step_by(width)
        .map(move |start| &text[start..(start + width).min(bytes.len())])
}

fn hollerith(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!("{}H{}", text.len(), text)
    }
}

/// 只保留可打印 ASCII
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

fn has_rotation(location: &Isometry3<f64>) -> bool {
    location.rotation.angle() > f64::EPSILON
}

// ========== 读取 ==========

/// 目录项
#[derive(Debug)]
struct DirectoryEntry {
    line: usize,
    pointer: usize,
    entity_type: u32,
    param_start: usize,
    param_count: usize,
}

/// 参数段中的一个值
#[derive(Debug, Clone, PartialEq)]
enum Field {
    Empty,
    Text(String),
    Number(f64),
}

pub(crate) fn read<R: Read>(
    reader: R,
    shapes: &mut ShapeDocument,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    let mut directory_lines = Vec::new();
    let mut param_lines = Vec::new();
    let mut saw_terminate = false;

    for (index, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if line.len() < 73 || !line.is_ascii() {
            return Err(CodecError::parse(line_no, "not an 80-column IGES record"));
        }
        match line.as_bytes()[72] {
            b'S' | b'G' => {}
            b'D' => directory_lines.push((line_no, line.to_string())),
            b'P' => param_lines.push(line[..PARAM_COLUMNS].to_string()),
            b'T' => saw_terminate = true,
            other => {
                return Err(CodecError::parse(
                    line_no,
                    format!("unknown section '{}'", other as char),
                ))
            }
        }
    }
    if !saw_terminate {
        return Err(CodecError::InvalidContent("missing IGES terminate section".into()));
    }
    if directory_lines.len() % 2 != 0 {
        return Err(CodecError::InvalidContent("odd number of directory lines".into()));
    }
    progress.check()?;

    let mut entries = Vec::with_capacity(directory_lines.len() / 2);
    for (pair, lines) in directory_lines.chunks(2).enumerate() {
        let (line_no, first) = &lines[0];
        let (_, second) = &lines[1];
        let field = |text: &str, n: usize| -> CodecResult<usize> {
            let raw = text[n * 8..n * 8 + 8].trim();
            if raw.is_empty() {
                return Ok(0);
            }
            raw.parse()
                .map_err(|_| CodecError::parse(*line_no, format!("invalid directory field '{raw}'")))
        };
        entries.push(DirectoryEntry {
            line: *line_no,
            pointer: 2 * pair + 1,
            entity_type: field(first, 0)? as u32,
            param_start: field(first, 1)?,
            param_count: field(second, 3)?,
        });
    }

    let params_of = |entry: &DirectoryEntry| -> CodecResult<Vec<Field>> {
        let start = entry.param_start.saturating_sub(1);
        let end = start + entry.param_count.max(1);
        let text = param_lines
            .get(start..end)
            .ok_or_else(|| CodecError::parse(entry.line, "parameter data out of range"))?
            .concat();
        parse_fields(&text).map_err(|message| CodecError::parse(entry.line, message))
    };

    // 子图定义
    let total = entries.len();
    let mut done = 0;
    let mut definitions: HashMap<usize, LabelId> = HashMap::new();
    let mut assemblies: Vec<(LabelId, &DirectoryEntry, Vec<usize>)> = Vec::new();
    for entry in entries.iter().filter(|e| e.entity_type == SUBFIGURE_DEFINITION) {
        let fields = params_of(entry)?;
        let depth = number(&fields, 1, entry)?;
        let name = match fields.get(2) {
            Some(Field::Text(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };
        let label = if depth > 0.0 {
            let count = number(&fields, 3, entry)? as usize;
            let members = (0..count)
                .map(|i| number(&fields, 4 + i, entry).map(|v| v as usize))
                .collect::<CodecResult<Vec<_>>>()?;
            let label = shapes.add_assembly(name);
            assemblies.push((label, entry, members));
            label
        } else {
            shapes.add_part(name, ShapeType::Solid, None)
        };
        definitions.insert(entry.pointer, label);
        done += 1;
        progress.step(done, total)?;
    }

    // 子图实例
    let by_pointer: HashMap<usize, &DirectoryEntry> = entries.iter().map(|e| (e.pointer, e)).collect();
    for (assembly, entry, members) in assemblies {
        for member in members {
            let Some(&instance) = by_pointer.get(&member).filter(|e| e.entity_type == SUBFIGURE_INSTANCE) else {
                debug!("IGES: skipping non-instance member DE {} of DE {}", member, entry.pointer);
                continue;
            };
            let fields = params_of(instance)?;
            let definition = number(&fields, 1, instance)? as usize;
            let referred = definitions.get(&definition).copied().ok_or_else(|| {
                CodecError::parse(instance.line, format!("instance of unknown definition DE {definition}"))
            })?;
            let x = number(&fields, 2, instance)?;
            let y = number(&fields, 3, instance)?;
            let z = number(&fields, 4, instance)?;
            if let Some(Field::Number(scale)) = fields.get(5) {
                if (*scale - 1.0).abs() > f64::EPSILON {
                    warn!("IGES: ignoring scale {} of instance DE {}", scale, instance.pointer);
                }
            }
            shapes.add_component(assembly, referred, Isometry3::translation(x, y, z), None)?;
            done += 1;
            progress.step(done, total)?;
        }
    }

    // 装配层数受限，后续递归遍历依赖这一点
    shapes.validate()?;
    debug!("IGES: {} directory entries, {} definitions", total, definitions.len());
    Ok(())
}

fn number(fields: &[Field], index: usize, entry: &DirectoryEntry) -> CodecResult<f64> {
    match fields.get(index) {
        Some(Field::Number(n)) if n.is_finite() => Ok(*n),
        Some(Field::Empty) => Ok(0.0),
        _ => Err(CodecError::parse(
            entry.line,
            format!("entity {} expects a number at parameter {}", entry.entity_type, index),
        )),
    }
}

/// 切分参数数据：`,` 分隔，`;` 结束，支持 Hollerith 字符串
fn parse_fields(text: &str) -> Result<Vec<Field>, String> {
    let bytes = text.as_bytes();
    let mut fields = Vec::new();
    let mut pos = 0;
    loop {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        let field = if pos > start && bytes.get(pos) == Some(&b'H') {
            let len: usize = text[start..pos].parse().map_err(|_| "invalid Hollerith length")?;
            let begin = pos + 1;
            let end = begin
                .checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or("truncated Hollerith string")?;
            pos = end;
            Field::Text(String::from_utf8_lossy(&bytes[begin..end]).into_owned())
        } else {
            while pos < bytes.len() && bytes[pos] != b',' && bytes[pos] != b';' {
                pos += 1;
            }
            let raw = text[start..pos].trim();
            if raw.is_empty() {
                Field::Empty
            } else {
                // IGES 允许 D 作为指数标记
                let normalized = raw.replace(['D', 'd'], "E");
                Field::Number(
                    normalized
                        .parse()
                        .map_err(|_| format!("invalid number '{raw}'"))?,
                )
            }
        };
        fields.push(field);

        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        match bytes.get(pos) {
            Some(b',') => pos += 1,
            Some(b';') => return Ok(fields),
            _ => return Err("unterminated parameter record".into()),
        }
    }
}
