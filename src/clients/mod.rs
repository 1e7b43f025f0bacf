//! 外部服务客户端
//!
//! `ExtractionClient` 是提取服务的接缝：提取逻辑只依赖这个 trait，
//! 生产环境使用 `LlmExtractionClient`，测试使用进程内替身。

pub mod llm_client;

use async_trait::async_trait;

use crate::error::ExtractionResult;
use crate::infrastructure::StagedFile;

pub use llm_client::LlmExtractionClient;

/// 已上传到提取服务的文件引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub mime_type: String,
    /// 服务端可引用的地址
    pub uri: String,
}

/// 文档理解服务
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// 模型名称（用于日志和错误信息）
    fn model_name(&self) -> &str;

    /// 上传单个暂存文件
    async fn upload(&self, file: &StagedFile) -> ExtractionResult<UploadedFile>;

    /// 引用全部已上传文件发起一次结构化提取，返回文本；`None` 表示空响应
    async fn generate(
        &self,
        files: &[UploadedFile],
        instruction: &str,
    ) -> ExtractionResult<Option<String>>;
}
