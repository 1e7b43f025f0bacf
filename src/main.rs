use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use school_record_submit::models::Owner;
use school_record_submit::services::SourceFile;
use school_record_submit::utils::logging;
use school_record_submit::{App, Config, SubmissionMethod};

/// 学生档案录入与提交
#[derive(Parser, Debug)]
#[command(name = "school-record", version, about, long_about = None)]
struct Cli {
    /// 配置文件（TOML）；未指定时只读取环境变量
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 当前登录的学生 id
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 上传成绩单扫描件（PDF/图片），自动提取后提交
    Extract {
        /// 提交方式：pdf 或 image；默认按文件类型推断
        #[arg(long)]
        method: Option<SubmissionMethod>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// 从 TOML 文件手动提交
    Submit { file: PathBuf },
    /// 用 TOML 文件覆盖已有档案
    Edit {
        file: PathBuf,
        /// 目标记录 id；默认最近一份
        #[arg(long)]
        record: Option<String>,
    },
    /// 草稿管理
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
    /// 列出已提交的档案
    List,
    /// 输出档案内容（JSON）
    Show {
        /// 记录 id；默认最近一份
        record: Option<String>,
    },
    /// 设置审核标记
    Verify {
        record: String,
        /// 撤销审核
        #[arg(long)]
        revoke: bool,
    },
    /// 批量导入目录下的 TOML 档案（文件名即学生 id）
    Import { folder: String },
}

#[derive(Subcommand, Debug)]
enum DraftAction {
    /// 输出草稿内容（JSON）
    Show,
    /// 恢复草稿并提交
    Submit,
    /// 丢弃草稿
    Discard,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env()?,
    };

    // 初始化日志
    logging::init(config.verbose_logging);

    let app = App::initialize(config)?;
    let owner = || Owner::authenticate(cli.user.as_deref()).context("请使用 --user 指定学生 id");

    match &cli.command {
        Command::Extract { method, files } => {
            let sources = read_source_files(files).await?;
            let method = match method {
                Some(method) => *method,
                None => infer_method(&sources),
            };
            let record_id = app.submit_files(owner()?, method, sources).await?;
            println!("{}", record_id);
        }
        Command::Submit { file } => {
            let record_id = app.submit_toml(owner()?, file).await?;
            println!("{}", record_id);
        }
        Command::Edit { file, record } => {
            let record_id = app.edit_with_toml(owner()?, record.as_deref(), file).await?;
            println!("{}", record_id);
        }
        Command::Draft { action } => match action {
            DraftAction::Show => match app.show_draft(&owner()?)? {
                Some(draft) => println!("{}", serde_json::to_string_pretty(&draft)?),
                None => println!("没有草稿"),
            },
            DraftAction::Submit => {
                let record_id = app.submit_draft(owner()?).await?;
                println!("{}", record_id);
            }
            DraftAction::Discard => app.discard_draft(&owner()?)?,
        },
        Command::List => {
            for record in app.list_records(&owner()?)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.id,
                    record.submission_method,
                    record.grade_level,
                    if record.is_verified { "已审核" } else { "未审核" },
                    record.updated_at
                );
            }
        }
        Command::Show { record } => match app.load_record(&owner()?, record.as_deref())? {
            Some((parent, record)) => {
                let output = serde_json::json!({ "record": parent, "sections": record });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            None => println!("没有已提交的档案"),
        },
        Command::Verify { record, revoke } => app.set_verified(record, !revoke)?,
        Command::Import { folder } => {
            let stats = app.import_folder(folder).await?;
            if stats.failed > 0 {
                bail!("{} 个档案导入失败", stats.failed);
            }
        }
    }

    Ok(())
}

async fn read_source_files(paths: &[PathBuf]) -> Result<Vec<SourceFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(read_source_file(path).await?);
    }
    Ok(files)
}

async fn read_source_file(path: &Path) -> Result<SourceFile> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("无效的文件路径: {}", path.display()))?;
    let Some(mime_type) = SourceFile::guess_mime_type(&file_name) else {
        bail!("无法识别的文件类型: {}", file_name);
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("无法读取文件: {}", path.display()))?;
    Ok(SourceFile::new(file_name, mime_type, bytes))
}

/// 全部是 PDF 时按 pdf 提交，否则按 image
fn infer_method(files: &[SourceFile]) -> SubmissionMethod {
    if files.iter().all(|f| f.mime_type == "application/pdf") {
        SubmissionMethod::Pdf
    } else {
        SubmissionMethod::Image
    }
}
