//! STEP (ISO 10303-21) 装配结构
//!
//! 只使用以下实体，按标签顺序写出：
//!
//! ```text
//! #1=PRODUCT('frame','ASSEMBLY');
//! #2=PRODUCT('bolt','SOLID');
//! #3=SHAPE_ASPECT('head',#2,'FACE');
//! #4=NEXT_ASSEMBLY_USAGE_OCCURRENCE('bolt-1',#1,#2,(10.0,0.0,0.0),(1.0,0.0,0.0,0.0));
//! #5=TRIANGULATED_FACE_SET(#2,((0.0,0.0,0.0),...),((1,2,3),...));
//! ```
//!
//! 实数以最短无损形式写出，因此装配结构、定位和网格可以无损往返。

use std::collections::HashMap;
use std::io::{Read, Write};

use nalgebra::Point3;
use tracing::debug;
use zpart_core::mesh::TriangleMesh;
use zpart_core::shape::{LabelId, LabelKind, ShapeDocument, ShapeType};

use super::isometry_from_parts;
use crate::error::{CodecError, CodecResult};
use crate::format::STEP_MAGIC;
use crate::progress::Progress;

const PRODUCT: &str = "PRODUCT";
const NAUO: &str = "NEXT_ASSEMBLY_USAGE_OCCURRENCE";
const SHAPE_ASPECT: &str = "SHAPE_ASPECT";
const FACE_SET: &str = "TRIANGULATED_FACE_SET";
const ASSEMBLY_TYPE: &str = "ASSEMBLY";
/// 参数列表允许的最大嵌套层数
const MAX_LIST_DEPTH: usize = 64;

// ========== 写出 ==========

pub(crate) fn write<W: Write>(
    shapes: &ShapeDocument,
    file_name: &str,
    mut writer: W,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    // 预先分配实体编号，组件可以前向引用
    let mut entity_ids = HashMap::new();
    let mut next_id = 1u32;
    for (label, data) in shapes.labels() {
        entity_ids.insert(label, next_id);
        next_id += match &data.kind {
            LabelKind::Simple { mesh: Some(_), .. } => 2,
            _ => 1,
        };
    }
    let entity = |label: LabelId| -> CodecResult<u32> {
        entity_ids
            .get(&label)
            .copied()
            .ok_or_else(|| CodecError::InvalidContent(format!("dangling label {label}")))
    };

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S");
    writeln!(writer, "{STEP_MAGIC}")?;
    writeln!(writer, "HEADER;")?;
    writeln!(writer, "FILE_DESCRIPTION(('ZPart assembly'),'2;1');")?;
    writeln!(
        writer,
        "FILE_NAME({},'{timestamp}',(''),(''),'zpart','zpart','');",
        step_string(Some(file_name))
    )?;
    writeln!(writer, "FILE_SCHEMA(('ZPART_ASSEMBLY'));")?;
    writeln!(writer, "ENDSEC;")?;
    writeln!(writer, "DATA;")?;

    let total = shapes.len();
    for (index, (label, data)) in shapes.labels().enumerate() {
        let id = entity(label)?;
        let name = step_string(data.name.as_deref());
        match &data.kind {
            LabelKind::Assembly { .. } => {
                writeln!(writer, "#{id}={PRODUCT}({name},'{ASSEMBLY_TYPE}');")?;
            }
            LabelKind::Simple {
                shape_type, mesh, ..
            } => {
                writeln!(
                    writer,
                    "#{id}={PRODUCT}({name},'{}');",
                    shape_type.name().to_ascii_uppercase()
                )?;
                if let Some(mesh) = mesh {
                    write!(writer, "#{}={FACE_SET}(#{id},", id + 1)?;
                    write_mesh(&mut writer, mesh)?;
                    writeln!(writer, ");")?;
                }
            }
            LabelKind::Reference { referred, location } => {
                let t = location.translation.vector;
                let q = location.rotation.coords;
                writeln!(
                    writer,
                    "#{id}={NAUO}({name},#{},#{},({},{},{}),({},{},{},{}));",
                    entity(data.father)?,
                    entity(*referred)?,
                    real(t.x)?,
                    real(t.y)?,
                    real(t.z)?,
                    real(q.w)?,
                    real(q.x)?,
                    real(q.y)?,
                    real(q.z)?,
                )?;
            }
            LabelKind::SubShape { shape_type } => {
                writeln!(
                    writer,
                    "#{id}={SHAPE_ASPECT}({name},#{},'{}');",
                    entity(data.father)?,
                    shape_type.name().to_ascii_uppercase()
                )?;
            }
        }
        progress.step(index + 1, total)?;
    }

    writeln!(writer, "ENDSEC;")?;
    writeln!(writer, "END-ISO-10303-21;")?;
    writer.flush()?;
    Ok(())
}

fn write_mesh<W: Write>(writer: &mut W, mesh: &TriangleMesh) -> CodecResult<()> {
    write!(writer, "(")?;
    for (i, v) in mesh.vertices.iter().enumerate() {
        let sep = if i == 0 { "" } else { "," };
        write!(writer, "{sep}({},{},{})", real(v.x)?, real(v.y)?, real(v.z)?)?;
    }
    write!(writer, "),(")?;
    for (i, t) in mesh.triangles.iter().enumerate() {
        let sep = if i == 0 { "" } else { "," };
        // STEP 索引从 1 开始
        let [a, b, c] = t.map(|i| face_index(i, mesh.vertices.len()));
        write!(writer, "{sep}({},{},{})", a?, b?, c?)?;
    }
    write!(writer, ")")?;
    Ok(())
}

/// 以 1 为起点的顶点索引，越界时报错
fn face_index(index: u32, vertex_count: usize) -> CodecResult<u64> {
    if (index as usize) < vertex_count {
        Ok(u64::from(index) + 1)
    } else {
        Err(CodecError::InvalidContent(format!(
            "vertex index {index} out of {vertex_count}"
        )))
    }
}

/// 实数的最短无损表示
fn real(value: f64) -> CodecResult<String> {
    if value.is_finite() {
        Ok(format!("{value:?}"))
    } else {
        Err(CodecError::InvalidContent(format!("non-finite value {value}")))
    }
}

/// 字符串参数；缺省为 `$`，单引号写成两个
fn step_string(value: Option<&str>) -> String {
    match value {
        Some(s) => format!("'{}'", s.replace('\'', "''")),
        None => "$".to_string(),
    }
}

// ========== 读取 ==========

/// 参数值
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Str(String),
    Ref(u32),
    Num(f64),
    Enum(String),
    List(Vec<Param>),
    Unset,
}

/// DATA 段中的一条记录
#[derive(Debug)]
struct Record {
    line: usize,
    id: u32,
    keyword: String,
    params: Vec<Param>,
}

impl Record {
    fn error(&self, message: impl Into<String>) -> CodecError {
        CodecError::parse(self.line, format!("#{}: {}", self.id, message.into()))
    }

    fn param(&self, index: usize) -> CodecResult<&Param> {
        self.params
            .get(index)
            .ok_or_else(|| self.error(format!("{} expects parameter {}", self.keyword, index + 1)))
    }

    fn name(&self, index: usize) -> CodecResult<Option<String>> {
        match self.param(index)? {
            Param::Str(s) => Ok(Some(s.clone())),
            Param::Unset => Ok(None),
            other => Err(self.error(format!("expected string, found {other:?}"))),
        }
    }

    fn text(&self, index: usize) -> CodecResult<&str> {
        match self.param(index)? {
            Param::Str(s) | Param::Enum(s) => Ok(s),
            other => Err(self.error(format!("expected string, found {other:?}"))),
        }
    }

    fn reference(&self, index: usize) -> CodecResult<u32> {
        match self.param(index)? {
            Param::Ref(id) => Ok(*id),
            other => Err(self.error(format!("expected entity reference, found {other:?}"))),
        }
    }

    fn list(&self, index: usize) -> CodecResult<&[Param]> {
        match self.param(index)? {
            Param::List(items) => Ok(items),
            other => Err(self.error(format!("expected list, found {other:?}"))),
        }
    }

    fn reals<const N: usize>(&self, items: &[Param]) -> CodecResult<[f64; N]> {
        if items.len() != N {
            return Err(self.error(format!("expected {N} numbers, found {}", items.len())));
        }
        let mut out = [0.0; N];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = match item {
                Param::Num(n) => *n,
                other => return Err(self.error(format!("expected number, found {other:?}"))),
            };
        }
        Ok(out)
    }
}

/// 解析 STEP 文本并把装配结构加入 `shapes`
pub(crate) fn read<R: Read>(
    mut reader: R,
    shapes: &mut ShapeDocument,
    progress: &mut Progress<'_>,
) -> CodecResult<()> {
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    let records = Lexer::new(&content).parse_exchange_file()?;
    progress.check()?;

    let total = records.len();
    let mut done = 0;
    let mut labels: HashMap<u32, LabelId> = HashMap::new();
    let lookup = |labels: &HashMap<u32, LabelId>, record: &Record, id: u32| -> CodecResult<LabelId> {
        labels
            .get(&id)
            .copied()
            .ok_or_else(|| record.error(format!("reference to unknown product #{id}")))
    };

    // 先创建所有产品，组件可能前向引用
    for record in records.iter().filter(|r| r.keyword == PRODUCT) {
        let name = record.name(0)?;
        let kind = record.text(1)?;
        let label = if kind.eq_ignore_ascii_case(ASSEMBLY_TYPE) {
            shapes.add_assembly(name)
        } else {
            let shape_type = ShapeType::from_name(kind)
                .ok_or_else(|| record.error(format!("unknown product type '{kind}'")))?;
            shapes.add_part(name, shape_type, None)
        };
        labels.insert(record.id, label);
        done += 1;
        progress.step(done, total)?;
    }

    for record in records.iter().filter(|r| r.keyword != PRODUCT) {
        match record.keyword.as_str() {
            NAUO => {
                let name = record.name(0)?;
                let assembly = lookup(&labels, record, record.reference(1)?)?;
                let referred = lookup(&labels, record, record.reference(2)?)?;
                let translation = record.reals::<3>(record.list(3)?)?;
                let rotation = record.reals::<4>(record.list(4)?)?;
                let location =
                    isometry_from_parts(translation, rotation).map_err(|e| record.error(e.to_string()))?;
                shapes.add_component(assembly, referred, location, name)?;
            }
            SHAPE_ASPECT => {
                let name = record.name(0)?;
                let parent = lookup(&labels, record, record.reference(1)?)?;
                let kind = record.text(2)?;
                let shape_type = ShapeType::from_name(kind)
                    .ok_or_else(|| record.error(format!("unknown shape type '{kind}'")))?;
                shapes.add_sub_shape(parent, shape_type, name)?;
            }
            FACE_SET => {
                let part = lookup(&labels, record, record.reference(0)?)?;
                let mesh = read_mesh(record)?;
                shapes.set_mesh(part, mesh)?;
            }
            other => debug!("STEP: skipping unsupported entity #{} {}", record.id, other),
        }
        done += 1;
        progress.step(done, total)?;
    }

    // 装配层数受限，后续递归遍历依赖这一点
    shapes.validate()?;
    debug!("STEP: {} entities, {} products", total, labels.len());
    Ok(())
}

fn read_mesh(record: &Record) -> CodecResult<TriangleMesh> {
    let mut mesh = TriangleMesh::new();
    for point in record.list(1)? {
        let Param::List(coords) = point else {
            return Err(record.error("expected coordinate triple"));
        };
        let [x, y, z] = record.reals::<3>(coords)?;
        mesh.vertices.push(Point3::new(x, y, z));
    }
    let vertex_count = mesh.vertices.len();
    for triangle in record.list(2)? {
        let Param::List(indices) = triangle else {
            return Err(record.error("expected index triple"));
        };
        let mut out = [0u32; 3];
        for (slot, index) in out.iter_mut().zip(record.reals::<3>(indices)?) {
            if index.fract() != 0.0 || index < 1.0 || index > vertex_count as f64 {
                return Err(record.error(format!("vertex index {index} out of range")));
            }
            *slot = index as u32 - 1;
        }
        mesh.triangles.push(out);
    }
    Ok(mesh)
}

/// 交换文件词法/语法分析
struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    depth: usize,
}

impl<'a> Lexer<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            bytes: content.as_bytes(),
            pos: 0,
            line: 1,
            depth: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> CodecError {
        CodecError::parse(self.line, message)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    /// 跳过空白和 `/* */` 注释
    fn skip_trivia(&mut self) -> CodecResult<()> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn expect(&mut self, expected: u8) -> CodecResult<()> {
        self.skip_trivia()?;
        match self.bump() {
            Some(b) if b == expected => Ok(()),
            Some(b) => Err(self.error(format!(
                "expected '{}', found '{}'",
                expected as char, b as char
            ))),
            None => Err(self.error(format!("expected '{}', found end of file", expected as char))),
        }
    }

    fn keyword(&mut self) -> CodecResult<String> {
        self.skip_trivia()?;
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error("expected keyword"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn integer(&mut self) -> CodecResult<u32> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("expected entity number"))
    }

    fn parse_exchange_file(&mut self) -> CodecResult<Vec<Record>> {
        self.skip_trivia()?;
        if !self.bytes[self.pos..].starts_with(STEP_MAGIC.as_bytes()) {
            return Err(CodecError::InvalidContent("missing ISO-10303-21 header".into()));
        }
        self.pos += STEP_MAGIC.len();

        let mut records = Vec::new();
        loop {
            let section = self.keyword()?;
            self.expect(b';')?;
            match section.as_str() {
                "HEADER" => self.skip_header()?,
                "DATA" => self.parse_data(&mut records)?,
                "END-ISO-10303-21" => return Ok(records),
                other => return Err(self.error(format!("unexpected section '{other}'"))),
            }
        }
    }

    fn skip_header(&mut self) -> CodecResult<()> {
        loop {
            let keyword = self.keyword()?;
            if keyword == "ENDSEC" {
                return self.expect(b';');
            }
            self.expect(b'(')?;
            self.list_tail()?;
            self.expect(b';')?;
        }
    }

    fn parse_data(&mut self, records: &mut Vec<Record>) -> CodecResult<()> {
        loop {
            self.skip_trivia()?;
            if self.peek() != Some(b'#') {
                let keyword = self.keyword()?;
                if keyword != "ENDSEC" {
                    return Err(self.error(format!("expected entity instance, found '{keyword}'")));
                }
                return self.expect(b';');
            }
            let line = self.line;
            self.bump();
            let id = self.integer()?;
            self.expect(b'=')?;
            let keyword = self.keyword()?;
            self.expect(b'(')?;
            let params = self.list_tail()?;
            self.expect(b';')?;
            records.push(Record {
                line,
                id,
                keyword,
                params,
            });
        }
    }

    /// 解析 `(` 之后直到匹配的 `)` 的参数列表
    fn list_tail(&mut self) -> CodecResult<Vec<Param>> {
        if self.depth >= MAX_LIST_DEPTH {
            return Err(self.error("parameter nesting too deep"));
        }
        self.depth += 1;
        let items = self.list_items();
        self.depth -= 1;
        items
    }

    fn list_items(&mut self) -> CodecResult<Vec<Param>> {
        let mut items = Vec::new();
        self.skip_trivia()?;
        if self.peek() == Some(b')') {
            self.bump();
            return Ok(items);
        }
        loop {
            items.push(self.param()?);
            self.skip_trivia()?;
            match self.bump() {
                Some(b',') => {}
                Some(b')') => return Ok(items),
                _ => return Err(self.error("expected ',' or ')' in parameter list")),
            }
        }
    }

    fn param(&mut self) -> CodecResult<Param> {
        self.skip_trivia()?;
        match self.peek() {
            Some(b'\'') => self.string().map(Param::Str),
            Some(b'#') => {
                self.bump();
                self.integer().map(Param::Ref)
            }
            Some(b'(') => {
                self.bump();
                self.list_tail().map(Param::List)
            }
            Some(b'$') | Some(b'*') => {
                self.bump();
                Ok(Param::Unset)
            }
            Some(b'.') if matches!(self.bytes.get(self.pos + 1), Some(b) if b.is_ascii_alphabetic()) => {
                self.bump();
                let value = self.keyword()?;
                self.expect(b'.')?;
                Ok(Param::Enum(value))
            }
            Some(b) if b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.') => self.number(),
            Some(b) if b.is_ascii_alphabetic() => {
                // 类型化参数，如 LENGTH_MEASURE(1.0)
                let _ = self.keyword()?;
                self.expect(b'(')?;
                let mut inner = self.list_tail()?;
                Ok(if inner.len() == 1 { inner.remove(0) } else { Param::List(inner) })
            }
            Some(b) => Err(self.error(format!("unexpected character '{}'", b as char))),
            None => Err(self.error("unexpected end of file")),
        }
    }

    fn string(&mut self) -> CodecResult<String> {
        self.bump();
        let mut raw = Vec::new();
        loop {
            match self.bump() {
                Some(b'\'') if self.peek() == Some(b'\'') => {
                    self.bump();
                    raw.push(b'\'');
                }
                Some(b'\'') => break,
                Some(b) => raw.push(b),
                None => return Err(self.error("unterminated string")),
            }
        }
        String::from_utf8(raw).map_err(|_| self.error("string is not valid UTF-8"))
    }

    fn number(&mut self) -> CodecResult<Param> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'.')) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        text.parse::<f64>()
            .map(Param::Num)
            .map_err(|_| self.error(format!("invalid number '{text}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{describe, sample_document};

    fn export(shapes: &ShapeDocument) -> String {
        let mut bytes = Vec::new();
        write(shapes, "sample.step", &mut bytes, &mut Progress::start(None)).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let (source, _) = sample_document();
        let text = export(&source);
        assert!(text.starts_with(STEP_MAGIC));
        assert!(text.contains("PRODUCT('frame','ASSEMBLY')"));

        let mut target = ShapeDocument::new();
        read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap();
        assert_eq!(describe(&target), describe(&source));
    }

    #[test]
    fn test_names_with_quotes() {
        let mut source = ShapeDocument::new();
        source.add_part(Some("it's".into()), ShapeType::Solid, None);
        let text = export(&source);
        assert!(text.contains("'it''s'"));

        let mut target = ShapeDocument::new();
        read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap();
        assert_eq!(target.name(target.free_shapes()[0]), Some("it's"));
    }

    #[test]
    fn test_tolerates_comments_and_unknown_entities() {
        let text = "ISO-10303-21;\nHEADER;\nFILE_SCHEMA(('X'));\nENDSEC;\nDATA;\n\
                    /* exported by hand */\n#10=PRODUCT('p',.SOLID.);\n\
                    #11=APPLICATION_CONTEXT('mechanical design');\nENDSEC;\nEND-ISO-10303-21;\n";
        let mut target = ShapeDocument::new();
        read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap();
        assert_eq!(target.free_shapes().len(), 1);
        assert_eq!(target.shape_type(target.free_shapes()[0]), Some(ShapeType::Solid));
    }

    #[test]
    fn test_malformed_input_reports_line() {
        let text = "ISO-10303-21;\nDATA;\n#1=PRODUCT('a','SOLID');\n#2=PRODUCT('b' 'SOLID');\nENDSEC;\n";
        let mut target = ShapeDocument::new();
        let err = read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::Parse { line: 4, .. }), "{err:?}");

        let err = read(&b"solid x"[..], &mut target, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidContent(_)));
    }

    #[test]
    fn test_dangling_reference_is_rejected() {
        let text = "ISO-10303-21;\nDATA;\n#1=PRODUCT('a','ASSEMBLY');\n\
                    #2=NEXT_ASSEMBLY_USAGE_OCCURRENCE($,#1,#9,(0.0,0.0,0.0),(1.0,0.0,0.0,0.0));\n\
                    ENDSEC;\nEND-ISO-10303-21;\n";
        let mut target = ShapeDocument::new();
        let err = read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::Parse { line: 4, .. }), "{err:?}");
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let text = format!(
            "ISO-10303-21;\nDATA;\n#1=PRODUCT('a',{});\nENDSEC;\n",
            "(".repeat(1_000_000)
        );
        let mut target = ShapeDocument::new();
        let err = read(text.as_bytes(), &mut target, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::Parse { line: 3, .. }), "{err:?}");

        let shallow = format!(
            "ISO-10303-21;\nDATA;\n#1=PRODUCT('a','SOLID',{}1{});\nENDSEC;\n",
            "(".repeat(8),
            ")".repeat(8)
        );
        read(shallow.as_bytes(), &mut target, &mut Progress::start(None)).unwrap();
    }

    #[test]
    fn test_mesh_index_out_of_range_fails_export() {
        let mut source = ShapeDocument::new();
        let mut mesh = TriangleMesh::new();
        mesh.push_triangle(Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0));
        mesh.triangles.push([u32::MAX, 0, 0]);
        source.add_part(None, ShapeType::Solid, Some(mesh));

        let mut bytes = Vec::new();
        let err = write(&source, "bad.step", &mut bytes, &mut Progress::start(None)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidContent(_)), "{err:?}");
    }
}
