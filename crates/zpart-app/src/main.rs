//! ZPart 命令行程序
//!
//! 用法：
//!   zpart formats                         列出支持的格式
//!   zpart info <file>                     导入文件并打印模型树
//!   zpart convert <input> <output>        格式转换
//!   zpart batch --to step -o out a b c    并行批量转换

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use rayon::prelude::*;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use zpart_core::model::{ApplicationItem, AssemblyModel, ModelEvent};
use zpart_core::registry::DocumentRegistry;
use zpart_core::tree::{deep_foreach_tree_node, TreeNodeId};
use zpart_io::{
    find_part_format, part_format_filter, part_formats, ExportOptions, Io, IoSettings, PartFormat,
    ProgressSink, StlFormat, StlIoLibrary,
};

#[derive(Parser)]
#[command(name = "zpart")]
#[command(about = "ZPart - 装配结构查看与格式转换")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON 格式的 I/O 设置文件
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 覆盖 STL 读写实现
    #[arg(long, global = true, value_parser = parse_stl_library)]
    stl_library: Option<StlIoLibrary>,

    /// 日志详细程度（-v 调试，-vv 跟踪）
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出支持的格式
    Formats,

    /// 导入文件并打印模型树
    Info {
        file: PathBuf,

        /// 指定格式，默认按扩展名和内容识别
        #[arg(long, value_parser = parse_format)]
        format: Option<PartFormat>,
    },

    /// 转换单个文件
    Convert {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, value_parser = parse_format)]
        from: Option<PartFormat>,

        #[arg(long, value_parser = parse_format)]
        to: Option<PartFormat>,

        #[command(flatten)]
        export: ExportArgs,
    },

    /// 并行转换多个文件
    Batch {
        /// 目标格式
        #[arg(long, value_parser = parse_format)]
        to: PartFormat,

        /// 输出目录
        #[arg(short, long)]
        out_dir: PathBuf,

        #[command(flatten)]
        export: ExportArgs,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// STL 导出选项，覆盖设置文件中的默认值
#[derive(clap::Args, Clone, Debug, Default)]
struct ExportArgs {
    /// 输出 ASCII STL
    #[arg(long)]
    stl_ascii: bool,

    /// ASCII STL 实体名
    #[arg(long)]
    solid_name: Option<String>,

    /// ASCII STL 坐标有效位数
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=17))]
    precision: Option<u8>,
}

impl ExportArgs {
    fn apply(&self, defaults: &ExportOptions) -> ExportOptions {
        let mut options = defaults.clone();
        if self.stl_ascii {
            options.stl_format = StlFormat::Ascii;
        }
        if let Some(name) = &self.solid_name {
            options.stla_solid_name = name.clone();
        }
        if let Some(precision) = self.precision {
            options.stla_float_precision = precision;
        }
        options
    }
}

/// 按格式名或扩展名解析
fn parse_format(value: &str) -> Result<PartFormat, String> {
    let by_name = part_formats()
        .iter()
        .copied()
        .find(|f| f.name().eq_ignore_ascii_case(value));
    match by_name.unwrap_or_else(|| PartFormat::from_extension(value.trim_start_matches('.'))) {
        PartFormat::Unknown => Err(format!("unknown part format '{value}'")),
        format => Ok(format),
    }
}

fn parse_stl_library(value: &str) -> Result<StlIoLibrary, String> {
    match value.to_ascii_lowercase().as_str() {
        "streaming" => Ok(StlIoLibrary::Streaming),
        "direct" => Ok(StlIoLibrary::Direct),
        _ => Err(format!("unknown STL library '{value}', expected 'streaming' or 'direct'")),
    }
}

fn load_settings(path: Option<&Path>) -> Result<IoSettings> {
    let Some(path) = path else {
        return Ok(IoSettings::default());
    };
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    IoSettings::from_json(&json).with_context(|| format!("Invalid config: {}", path.display()))
}

/// 把进度写到日志，每 10% 一条
struct LogProgress {
    label: String,
    last: AtomicU8,
}

impl LogProgress {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last: AtomicU8::new(0),
        }
    }
}

impl ProgressSink for LogProgress {
    fn set_value(&self, percent: u8) {
        let bucket = percent / 10;
        if self.last.fetch_max(bucket, Ordering::Relaxed) < bucket {
            debug!("{}: {}%", self.label, percent);
        }
    }

    fn is_abort_requested(&self) -> bool {
        false
    }
}

/// 解析文件格式，无法识别时报错
fn resolve_format(explicit: Option<PartFormat>, path: &Path) -> Result<PartFormat> {
    match explicit.unwrap_or_else(|| find_part_format(path)) {
        PartFormat::Unknown => bail!("Unable to detect part format of '{}'", path.display()),
        format => Ok(format),
    }
}

fn document_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string())
}

/// 导入到新文档，打印耗时
fn import_file(
    io: &Io,
    registry: &mut DocumentRegistry,
    path: &Path,
    format: PartFormat,
) -> Result<zpart_core::model::DocumentId> {
    let id = registry.add_document(document_name(path), format != PartFormat::Stl);
    let model = registry
        .document_mut(id)
        .context("Document vanished after creation")?;
    let progress = LogProgress::new(path.display().to_string());
    let started = Instant::now();
    match io.import_in_document(model, format, path, Some(&progress)) {
        Ok(()) => {
            info!("Import time: {}ms", started.elapsed().as_millis());
            Ok(id)
        }
        Err(e) => {
            error!("Failed to import part: '{}'", path.display());
            Err(e).with_context(|| format!("Failed to import part: '{}'", path.display()))
        }
    }
}

fn export_model(
    io: &Io,
    model: &AssemblyModel,
    format: PartFormat,
    options: &ExportOptions,
    path: &Path,
) -> Result<()> {
    let progress = LogProgress::new(path.display().to_string());
    let started = Instant::now();
    io.export_application_items(
        &[ApplicationItem::document(model)],
        format,
        options,
        path,
        Some(&progress),
    )
    .with_context(|| format!("Failed to export: '{}'", path.display()))?;
    info!("Export time: {}ms", started.elapsed().as_millis());
    Ok(())
}

fn cmd_formats() {
    for format in part_formats() {
        let options = if format.has_export_options() {
            " [export options]"
        } else {
            ""
        };
        println!("{:<6} {}{}", format.name(), part_format_filter(*format), options);
    }
}

fn cmd_info(io: &Io, file: &Path, format: Option<PartFormat>) -> Result<()> {
    let format = resolve_format(format, file)?;
    let mut registry = DocumentRegistry::new();
    let (tx, rx) = crossbeam::channel::unbounded::<ModelEvent>();

    let id = registry.add_document(document_name(file), format != PartFormat::Stl);
    let model = registry
        .document_mut(id)
        .context("Document vanished after creation")?;
    model.add_observer(Box::new(tx));
    let started = Instant::now();
    io.import_in_document(model, format, file, Some(&LogProgress::new(file.display().to_string())))
        .with_context(|| format!("Failed to import part: '{}'", file.display()))?;
    info!("Import time: {}ms", started.elapsed().as_millis());

    let added = rx.try_iter().filter(|e| matches!(e, ModelEvent::EntityAdded { .. })).count();
    println!("{} ({}, {}): {} entities", model.name(), format, file.display(), added);
    print_tree(model);
    Ok(())
}

fn print_tree(model: &AssemblyModel) {
    let tree = model.model_tree();
    deep_foreach_tree_node(tree, |node| {
        let depth = depth_of(model, node);
        let t = model.shape_absolute_location(node).translation.vector;
        let mesh = model
            .shapes()
            .mesh(model.label(node))
            .map(|m| format!(" [{} triangles]", m.triangle_count()))
            .unwrap_or_default();
        println!(
            "{}{} {} @ ({}, {}, {}){}",
            "  ".repeat(depth),
            node,
            model.node_name(node),
            t.x,
            t.y,
            t.z,
            mesh
        );
    });
}

fn depth_of(model: &AssemblyModel, node: TreeNodeId) -> usize {
    let mut depth = 0;
    let mut parent = model.model_tree().node_parent(node);
    while !parent.is_null() {
        depth += 1;
        parent = model.model_tree().node_parent(parent);
    }
    depth
}

fn convert(
    io: &Io,
    input: &Path,
    output: &Path,
    from: Option<PartFormat>,
    to: Option<PartFormat>,
    options: &ExportOptions,
) -> Result<()> {
    let from = resolve_format(from, input)?;
    let to = match to {
        Some(format) => format,
        None => match PartFormat::from_extension(
            output.extension().and_then(|e| e.to_str()).unwrap_or_default(),
        ) {
            PartFormat::Unknown => bail!("Unable to infer target format of '{}'", output.display()),
            format => format,
        },
    };

    let mut registry = DocumentRegistry::new();
    let id = import_file(io, &mut registry, input, from)?;
    let model = registry.document(id).context("Imported document vanished")?;
    export_model(io, model, to, options, output)?;
    println!("{} -> {}", input.display(), output.display());
    Ok(())
}

fn cmd_batch(io: &Io, files: &[PathBuf], to: PartFormat, out_dir: &Path, options: &ExportOptions) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;
    let extension = to.extensions().first().copied().unwrap_or("out");

    // 每个任务使用自己的注册表，文档之间互不影响
    let results: Vec<(PathBuf, Result<()>)> = files
        .par_iter()
        .map(|input| {
            let output = out_dir.join(format!("{}.{}", document_name(input), extension));
            let result = convert(io, input, &output, None, Some(to), options);
            (input.clone(), result)
        })
        .collect();

    let mut failed = 0;
    for (input, result) in &results {
        if let Err(e) = result {
            failed += 1;
            eprintln!("{}: {:#}", input.display(), e);
        }
    }
    info!("Batch finished: {} converted, {} failed", results.len() - failed, failed);
    if failed > 0 {
        bail!("{failed} of {} file(s) failed to convert", results.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .finish(),
    )?;

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(library) = cli.stl_library {
        settings.stl_io_library = library;
    }
    let io = Io::new(&settings);
    debug!("I/O settings: {:?}", settings);

    match cli.command {
        Commands::Formats => cmd_formats(),
        Commands::Info { file, format } => cmd_info(&io, &file, format)?,
        Commands::Convert {
            input,
            output,
            from,
            to,
            export,
        } => convert(&io, &input, &output, from, to, &export.apply(&settings.export))?,
        Commands::Batch {
            to,
            out_dir,
            export,
            files,
        } => cmd_batch(&io, &files, to, &out_dir, &export.apply(&settings.export))?,
    }
    Ok(())
}
