//! 上传文件暂存 - 基础设施层
//!
//! 每个待上传文件写入一个临时文件，由 `StagedFile` 持有；
//! `StagedFile` 被 drop 时临时文件随之删除，无论提取成功、失败、超时还是被取消。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// 暂存区
#[derive(Debug, Clone, Default)]
pub struct StagingArea {
    dir: Option<PathBuf>,
}

impl StagingArea {
    /// `dir` 为空时使用系统临时目录
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            dir: (!dir.as_os_str().is_empty()).then(|| dir.to_path_buf()),
        }
    }

    /// 写入一个暂存文件
    ///
    /// 创建与写入在同一个阻塞任务里完成：调用方的 future 中途被丢弃时，
    /// 临时文件随任务返回值一起 drop，不会残留。
    pub async fn stage(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> io::Result<StagedFile> {
        let dir = self.dir.clone();
        let suffix = extension_for(mime_type);
        let payload = bytes.to_vec();

        let temp = tokio::task::spawn_blocking(move || -> io::Result<NamedTempFile> {
            let mut builder = tempfile::Builder::new();
            builder.prefix("record-upload-").suffix(suffix);
            let mut temp = match dir {
                Some(dir) => {
                    std::fs::create_dir_all(&dir)?;
                    builder.tempfile_in(dir)?
                }
                None => builder.tempfile()?,
            };
            temp.write_all(&payload)?;
            temp.flush()?;
            Ok(temp)
        })
        .await
        .map_err(io::Error::other)??;

        debug!("暂存文件 {} -> {} ({} 字节)", file_name, temp.path().display(), bytes.len());

        Ok(StagedFile {
            temp,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            size: bytes.len(),
        })
    }
}

/// 已暂存的文件
#[derive(Debug)]
pub struct StagedFile {
    temp: NamedTempFile,
    pub file_name: String,
    pub mime_type: String,
    pub size: usize,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// 读回文件并编码为 data URL
    pub async fn to_data_url(&self) -> io::Result<String> {
        let bytes = tokio::fs::read(self.path()).await?;
        Ok(format!("data:{};base64,{}", self.mime_type, BASE64.encode(bytes)))
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "application/pdf" => ".pdf",
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "image/heic" => ".heic",
        "image/heif" => ".heif",
        _ => ".bin",
    }
}
