//! 手动录入档案的 TOML 加载器
//!
//! 文件格式与客户端分区键一致，例如：
//!
//! ```toml
//! [[generalSubjects]]
//! year = 1
//! semester = 1
//! subject = "国语"
//! credits = 4
//! ```

use crate::models::record::SchoolRecord;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载数据并转换为 SchoolRecord（每行分配新 id）
pub async fn load_toml_to_school_record(toml_file_path: &Path) -> Result<SchoolRecord> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    parse_school_record(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))
}

/// 解析 TOML 文本
pub fn parse_school_record(content: &str) -> Result<SchoolRecord> {
    let table: toml::Table = toml::from_str(content)?;
    let value = serde_json::to_value(table)?;
    SchoolRecord::from_json_sections(&value).map_err(anyhow::Error::msg)
}

/// 加载后的单个文件；解析失败的文件同样返回，由调用方计入失败
pub type LoadedRecord = (PathBuf, Result<SchoolRecord>);

/// 从文件夹中加载所有 TOML 档案，按文件路径排序
pub async fn load_all_toml_records(folder_path: &str) -> Result<Vec<LoadedRecord>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut records = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            tracing::info!(
                "正在加载: {}",
                path.file_name().unwrap_or_default().to_string_lossy()
            );

            let loaded = load_toml_to_school_record(&path).await;
            match &loaded {
                Ok(record) => tracing::info!("成功加载 {} 行", record.total_rows()),
                Err(e) => tracing::warn!("加载文件失败 {}: {:#}", path.display(), e),
            }
            records.push((path, loaded));
        }
    }

    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records)
}
