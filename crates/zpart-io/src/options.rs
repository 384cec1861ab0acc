//! 导出选项与 I/O 设置

use serde::{Deserialize, Serialize};

/// STL 编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StlFormat {
    Ascii,
    #[default]
    Binary,
}

/// STL 读写实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StlIoLibrary {
    /// 分块流式读写，写入临时文件后原子替换；支持实体名和浮点精度选项
    #[default]
    Streaming,
    /// 先合并网格再一次写出，直接写目标路径；忽略实体名和精度
    Direct,
}

impl StlIoLibrary {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => StlIoLibrary::Direct,
            _ => StlIoLibrary::Streaming,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            StlIoLibrary::Streaming => 0,
            StlIoLibrary::Direct => 1,
        }
    }
}

/// 导出选项，只有 STL 使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub stl_format: StlFormat,
    /// ASCII STL 的实体名；为空时使用文件名
    pub stla_solid_name: String,
    /// ASCII STL 坐标的有效位数
    pub stla_float_precision: u8,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            stl_format: StlFormat::Binary,
            stla_solid_name: String::new(),
            stla_float_precision: 9,
        }
    }
}

/// 进程级 I/O 设置，可从 JSON 配置文件加载
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    pub stl_io_library: StlIoLibrary,
    pub export: ExportOptions,
}

impl IoSettings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
