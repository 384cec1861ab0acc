//! 零件格式表
//!
//! 固定的格式枚举、扩展名映射、内容嗅探规则和文件选择器过滤字符串。
//! 这里的函数都是纯查表，只有 `find_part_format` 会读取文件头。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// 原生 BREP 文件的魔数
pub const BREP_MAGIC: &str = "ZPART-BREP";

/// STEP 文件的起始标记
pub const STEP_MAGIC: &str = "ISO-10303-21;";

/// 嗅探时读取的文件头字节数
const SNIFF_LEN: usize = 512;

/// 零件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartFormat {
    Unknown,
    Iges,
    Step,
    Brep,
    Stl,
}

/// 规范顺序，决定界面顺序和嗅探的优先级
const PART_FORMATS: [PartFormat; 4] = [
    PartFormat::Iges,
    PartFormat::Step,
    PartFormat::Brep,
    PartFormat::Stl,
];

impl PartFormat {
    /// 显示名称
    pub fn name(&self) -> &'static str {
        match self {
            PartFormat::Unknown => "Unknown",
            PartFormat::Iges => "IGES",
            PartFormat::Step => "STEP",
            PartFormat::Brep => "BREP",
            PartFormat::Stl => "STL",
        }
    }

    /// 扩展名（小写，不含点）
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            PartFormat::Unknown => &[],
            PartFormat::Iges => &["iges", "igs"],
            PartFormat::Step => &["step", "stp"],
            PartFormat::Brep => &["brep", "rle", "occ"],
            PartFormat::Stl => &["stl", "stla", "stlb"],
        }
    }

    /// 导出时是否使用 `ExportOptions`
    pub fn has_export_options(&self) -> bool {
        matches!(self, PartFormat::Stl)
    }

    /// 导出再导入后装配结构是否保持不变
    pub fn supports_structural_round_trip(&self) -> bool {
        matches!(self, PartFormat::Step | PartFormat::Brep)
    }

    /// 按扩展名查找（不区分大小写）
    pub fn from_extension(extension: &str) -> PartFormat {
        let extension = extension.to_ascii_lowercase();
        PART_FORMATS
            .into_iter()
            .find(|f| f.extensions().contains(&extension.as_str()))
            .unwrap_or(PartFormat::Unknown)
    }

    fn matches_content(&self, header: &[u8], file_len: u64) -> bool {
        match self {
            PartFormat::Unknown => false,
            PartFormat::Iges => {
                // 固定 80 列记录，第 73 列为段标识 'S'
                let first_line = header.split(|b| *b == b'\n').next().unwrap_or_default();
                let first_line = first_line.strip_suffix(b"\r").unwrap_or(first_line);
                first_line.len() == 80 && first_line[72] == b'S'
            }
            PartFormat::Step => trim_ascii_start(header).starts_with(STEP_MAGIC.as_bytes()),
            PartFormat::Brep => header.starts_with(BREP_MAGIC.as_bytes()),
            PartFormat::Stl => is_binary_stl(header, file_len) || is_ascii_stl(header),
        }
    }
}

impl fmt::Display for PartFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// 二进制 STL：80 字节头 + 三角形数，文件长度与三角形数一致
pub(crate) fn is_binary_stl(header: &[u8], file_len: u64) -> bool {
    if header.len() < 84 {
        return false;
    }
    let count = u32::from_le_bytes([header[80], header[81], header[82], header[83]]);
    file_len == 84 + 50 * u64::from(count)
}

/// ASCII STL：以 "solid" 开头且文件头中没有 NUL 字节
fn is_ascii_stl(header: &[u8]) -> bool {
    trim_ascii_start(header).starts_with(b"solid") && !header.contains(&0)
}

/// 所有支持的格式（规范顺序）
pub fn part_formats() -> &'static [PartFormat] {
    &PART_FORMATS
}

/// 文件选择器过滤字符串，如 `STEP files(*.step *.stp)`
pub fn part_format_filter(format: PartFormat) -> String {
    if format == PartFormat::Unknown {
        return String::new();
    }
    let patterns: Vec<String> = format
        .extensions()
        .iter()
        .map(|ext| format!("*.{ext}"))
        .collect();
    format!("{} files({})", format.name(), patterns.join(" "))
}

/// 所有格式的过滤字符串（规范顺序）
pub fn part_format_filters() -> Vec<String> {
    part_formats().iter().map(|f| part_format_filter(*f)).collect()
}

/// 由过滤字符串反查格式
pub fn part_format_from_filter(filter: &str) -> PartFormat {
    part_formats()
        .iter()
        .copied()
        .find(|f| part_format_filter(*f) == filter)
        .unwrap_or(PartFormat::Unknown)
}

/// 导出时是否有格式相关选项
pub fn has_export_options_for_format(format: PartFormat) -> bool {
    format.has_export_options()
}

/// 按文件内容嗅探格式；`file_len` 为完整文件长度
pub fn sniff_part_format(header: &[u8], file_len: u64) -> PartFormat {
    PART_FORMATS
        .into_iter()
        .find(|f| f.matches_content(header, file_len))
        .unwrap_or(PartFormat::Unknown)
}

/// 识别文件格式
///
/// 先看扩展名，扩展名缺失或无法识别时读取文件头嗅探内容。
/// 文件无法读取时返回 `PartFormat::Unknown`。
pub fn find_part_format(path: impl AsRef<Path>) -> PartFormat {
    let path = path.as_ref();
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(PartFormat::from_extension)
        .unwrap_or(PartFormat::Unknown);
    if by_extension != PartFormat::Unknown {
        return by_extension;
    }

    let Ok(file) = File::open(path) else {
        return PartFormat::Unknown;
    };
    let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mut header = Vec::with_capacity(SNIFF_LEN);
    if file.take(SNIFF_LEN as u64).read_to_end(&mut header).is_err() {
        return PartFormat::Unknown;
    }
    sniff_part_format(&header, file_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_find_by_extension_ignores_case() {
        assert_eq!(find_part_format("model.step"), PartFormat::Step);
        assert_eq!(find_part_format("model.STP"), PartFormat::Step);
        assert_eq!(find_part_format("/a/b/part.IgS"), PartFormat::Iges);
        assert_eq!(find_part_format("part.Brep"), PartFormat::Brep);
        assert_eq!(find_part_format("mesh.STL"), PartFormat::Stl);
    }

    #[test]
    fn test_unknown_when_nothing_matches() {
        assert_eq!(find_part_format("notes.txt"), PartFormat::Unknown);
        assert_eq!(find_part_format("no-such-file"), PartFormat::Unknown);
        assert_eq!(find_part_format(""), PartFormat::Unknown);
        assert_eq!(sniff_part_format(b"hello world", 11), PartFormat::Unknown);
    }

    #[test]
    fn test_sniff_content() {
        assert_eq!(
            sniff_part_format(b"ISO-10303-21;\nHEADER;\n", 22),
            PartFormat::Step
        );
        assert_eq!(sniff_part_format(b"ZPART-BREP 1\n{}", 15), PartFormat::Brep);
        assert_eq!(
            sniff_part_format(b"solid cube\n facet normal 0 0 1\n", 31),
            PartFormat::Stl
        );

        let mut binary = vec![0u8; 84];
        binary[80] = 2;
        assert_eq!(sniff_part_format(&binary, 84 + 100), PartFormat::Stl);
        assert_eq!(sniff_part_format(&binary, 84 + 99), PartFormat::Unknown);

        let iges = format!("{:<72}S      1\n", "zpart");
        assert_eq!(sniff_part_format(iges.as_bytes(), iges.len() as u64), PartFormat::Iges);
    }

    #[test]
    fn test_sniff_is_deterministic() {
        let samples: [&[u8]; 3] = [b"ISO-10303-21;", b"solid x", b"garbage"];
        for sample in samples {
            let first = sniff_part_format(sample, sample.len() as u64);
            for _ in 0..3 {
                assert_eq!(sniff_part_format(sample, sample.len() as u64), first);
            }
        }
    }

    #[test]
    fn test_find_falls_back_to_content() {
        let mut file = tempfile::Builder::new().suffix(".dat").tempfile().unwrap();
        writeln!(file, "ISO-10303-21;").unwrap();
        assert_eq!(find_part_format(file.path()), PartFormat::Step);
    }

    #[test]
    fn test_filters() {
        assert_eq!(part_format_filter(PartFormat::Step), "STEP files(*.step *.stp)");
        assert_eq!(part_format_filters().len(), part_formats().len());
        assert_eq!(
            part_format_from_filter("IGES files(*.iges *.igs)"),
            PartFormat::Iges
        );
        assert_eq!(part_format_from_filter("bogus"), PartFormat::Unknown);
        assert!(has_export_options_for_format(PartFormat::Stl));
        assert!(!has_export_options_for_format(PartFormat::Step));
    }
}
