//! 提取服务 - 业务能力层
//!
//! 只负责"把上传的文档变成 SchoolRecord"能力，不关心流程
//!
//! 处理顺序：
//! 1. 逐个文件暂存到临时文件，并发上传
//! 2. 引用全部文件发起一次结构化提取请求
//! 3. 严格按 JSON 解析响应
//! 4. 为每一行分配新的 id
//!
//! 暂存文件的生命周期绑定在单次 `extract` 调用上，任何退出路径都会删除。

use futures::future::try_join_all;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::ExtractionClient;
use crate::config::Config;
use crate::error::{ExtractionError, ExtractionResult};
use crate::infrastructure::StagingArea;
use crate::models::record::SchoolRecord;
use crate::models::section::SectionKey;
use crate::utils::logging::truncate_text;

/// 支持的文件类型
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/webp",
    "image/gif",
    "image/heic",
    "image/heif",
];

/// 待提取的原始文件
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// 按扩展名推断 MIME 类型
    pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
        let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some("application/pdf"),
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "webp" => Some("image/webp"),
            "gif" => Some("image/gif"),
            "heic" => Some("image/heic"),
            "heif" => Some("image/heif"),
            _ => None,
        }
    }
}

/// 提取服务
///
/// 职责：
/// - 暂存、上传文件，调用提取客户端
/// - 校验并归一化返回结果
/// - 不写存储
/// - 不重试
#[derive(Clone)]
pub struct ExtractionService {
    client: Option<Arc<dyn ExtractionClient>>,
    staging: StagingArea,
    timeout: Duration,
}

impl ExtractionService {
    /// 根据配置创建；未配置 API key 时服务不可用
    pub fn new(config: &Config) -> Self {
        let client: Option<Arc<dyn ExtractionClient>> = config
            .extraction_configured()
            .then(|| Arc::new(crate::clients::LlmExtractionClient::new(config)) as Arc<dyn ExtractionClient>);

        Self {
            client,
            staging: StagingArea::new(&config.staging_dir),
            timeout: config.extraction_timeout(),
        }
    }

    /// 使用指定客户端创建
    pub fn with_client(client: Arc<dyn ExtractionClient>, staging: StagingArea, timeout: Duration) -> Self {
        Self {
            client: Some(client),
            staging,
            timeout,
        }
    }

    /// 未配置客户端的服务
    pub fn unavailable() -> Self {
        Self {
            client: None,
            staging: StagingArea::default(),
            timeout: Duration::from_secs(0),
        }
    }

    pub fn is_available(&self) -> bool {
        self.client.is_some()
    }

    /// 从文件中提取档案
    pub async fn extract(&self, files: &[SourceFile]) -> ExtractionResult<SchoolRecord> {
        let client = self.client.as_ref().ok_or(ExtractionError::Unavailable)?;

        if files.is_empty() {
            return Err(ExtractionError::malformed("没有待提取的文件"));
        }
        for file in files {
            if !SUPPORTED_MIME_TYPES.contains(&file.mime_type.as_str()) {
                return Err(ExtractionError::UnsupportedMimeType {
                    file_name: file.file_name.clone(),
                    mime_type: file.mime_type.clone(),
                });
            }
        }

        info!("📄 开始提取 {} 个文件，模型: {}", files.len(), client.model_name());

        let seconds = self.timeout.as_secs();
        let response = tokio::time::timeout(self.timeout, self.upload_and_generate(client.as_ref(), files))
            .await
            .map_err(|_| {
                warn!("⚠️ 提取超时 ({} 秒)", seconds);
                ExtractionError::Timeout { seconds }
            })??;

        debug!("提取响应: {}", truncate_text(&response, 200));
        let record = parse_extraction_response(&response)?;
        info!("✓ 提取完成，共 {} 行", record.total_rows());
        Ok(record)
    }

    async fn upload_and_generate(
        &self,
        client: &dyn ExtractionClient,
        files: &[SourceFile],
    ) -> ExtractionResult<String> {
        // 暂存文件在本函数返回（或 future 被丢弃）时删除
        let staged = try_join_all(files.iter().map(|file| async move {
            self.staging
                .stage(&file.file_name, &file.mime_type, &file.bytes)
                .await
                .map_err(|source| ExtractionError::StagingFailed {
                    file_name: file.file_name.clone(),
                    source,
                })
        }))
        .await?;

        let uploaded = try_join_all(staged.iter().map(|file| client.upload(file))).await?;
        debug!("{} 个文件上传完成", uploaded.len());

        let instruction = build_extraction_instruction();
        client
            .generate(&uploaded, &instruction)
            .await?
            .ok_or_else(|| ExtractionError::EmptyResponse {
                model: client.model_name().to_string(),
            })
    }
}

/// 构建覆盖全部 11 个分区的输出格式说明
pub fn build_extraction_instruction() -> String {
    let mut schema = String::new();
    for section in SectionKey::ALL {
        let fields: Vec<String> = section
            .fields()
            .iter()
            .map(|f| format!("\"{}\": {}", f.client, f.kind.prompt_type()))
            .collect();
        schema.push_str(&format!(
            "  // {}\n  \"{}\": [ {{ {} }} ],\n",
            section.label(),
            section.client_key(),
            fields.join(", ")
        ));
    }

    format!(
        r#"请从提供的学生档案文档（PDF 或图片，可能有多页）中提取全部信息，并严格按照以下 JSON 结构输出。

【输出格式】
{{
{}}}

【要求】
- 必须输出全部 11 个键；文档中没有的分区输出空数组 []
- 每个分区是对象数组，每个对象只包含上面列出的字段
- 学年 year 为 1、2、3 之一；学期 semester 为 1 或 2
- 数字字段输出数字，不要带单位；无法识别的值输出 null
- 不要输出 id 字段
- 只输出 JSON，不要输出任何解释或 Markdown 标记"#,
        schema
    )
}

/// 严格解析提取结果
///
/// 允许外层包裹 Markdown 代码块，其余必须是合法 JSON 且符合分区结构。
pub fn parse_extraction_response(response: &str) -> ExtractionResult<SchoolRecord> {
    let text = strip_code_fence(response);
    if text.is_empty() {
        return Err(ExtractionError::EmptyResponse {
            model: String::new(),
        });
    }

    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ExtractionError::malformed(format!("不是合法 JSON: {}", e)))?;

    let mut record = SchoolRecord::from_json_sections(&value).map_err(ExtractionError::malformed)?;
    record.assign_fresh_ids();
    Ok(record)
}

fn strip_code_fence(text: &str) -> &str {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = FENCE.get_or_init(|| Regex::new(r"(?s)^\s*```[A-Za-z]*\s*\n?(.*?)\s*```\s*$").ok());
    match re.as_ref().and_then(|re| re.captures(text)).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::UploadedFile;
    use crate::infrastructure::StagedFile;
    use crate::models::grade::{derive_grade_level, GradeLevel};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    type Reply = Box<dyn Fn() -> ExtractionResult<Option<String>> + Send + Sync>;

    /// 进程内的提取服务替身
    struct FakeClient {
        reply: Reply,
        seen_paths: Mutex<Vec<PathBuf>>,
        delay: Option<Duration>,
    }

    impl FakeClient {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                seen_paths: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn replying(text: &'static str) -> Self {
            Self::new(Box::new(move || Ok(Some(text.to_string()))))
        }
    }

    #[async_trait]
    impl ExtractionClient for FakeClient {
        fn model_name(&self) -> &str {
            "fake"
        }

        async fn upload(&self, file: &StagedFile) -> ExtractionResult<UploadedFile> {
            assert!(file.path().exists());
            self.seen_paths.lock().unwrap().push(file.path().to_path_buf());
            Ok(UploadedFile {
                file_name: file.file_name.clone(),
                mime_type: file.mime_type.clone(),
                uri: format!("fake://{}", file.file_name),
            })
        }

        async fn generate(
            &self,
            files: &[UploadedFile],
            instruction: &str,
        ) -> ExtractionResult<Option<String>> {
            assert!(!files.is_empty());
            assert!(instruction.contains("generalSubjects"));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.reply)()
        }
    }

    fn service(client: Arc<FakeClient>, dir: &std::path::Path) -> ExtractionService {
        ExtractionService::with_client(client, StagingArea::new(dir), Duration::from_secs(30))
    }

    fn two_images() -> Vec<SourceFile> {
        vec![
            SourceFile::new("page1.png", "image/png", vec![1, 2, 3]),
            SourceFile::new("page2.jpg", "image/jpeg", vec![4, 5, 6]),
        ]
    }

    #[tokio::test]
    async fn test_two_images_three_subjects_get_ids_and_grade() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::replying(
            r#"{"generalSubjects": [
                {"year": 1, "subject": "国语"},
                {"year": 2, "subject": "数学"},
                {"year": 2, "subject": "英语"}
            ]}"#,
        ));

        let record = service(client.clone(), dir.path()).extract(&two_images()).await.unwrap();

        let rows = record.section(SectionKey::GeneralSubjects);
        assert_eq!(rows.len(), 3);
        let ids: HashSet<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(rows.iter().all(|r| !r.id.is_empty()));
        assert_eq!(derive_grade_level(&record), GradeLevel::High2);

        // 两个文件都上传过，且暂存文件已删除
        let seen = client.seen_paths.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_staged_files_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::new(Box::new(|| {
            Err(ExtractionError::AuthFailed {
                message: "bad key".into(),
            })
        })));

        let err = service(client.clone(), dir.path()).extract(&two_images()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::AuthFailed { .. }));

        let seen = client.seen_paths.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| !p.exists()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::new(Box::new(|| Ok(None))));
        let err = service(client, dir.path()).extract(&two_images()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn test_non_json_response_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::replying("抱歉，我无法识别这份文件。"));
        let err = service(client, dir.path()).extract(&two_images()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeClient::replying("{}");
        fake.delay = Some(Duration::from_secs(60));
        let client = Arc::new(fake);
        let service = ExtractionService::with_client(
            client.clone(),
            StagingArea::new(dir.path()),
            Duration::from_millis(300),
        );

        let err = service.extract(&two_images()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout { .. }));
        assert!(client.seen_paths.lock().unwrap().iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_unavailable_without_client() {
        let err = ExtractionService::unavailable().extract(&two_images()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Unavailable));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::replying("{}"));
        let files = vec![SourceFile::new("notes.docx", "application/msword", vec![0])];
        let err = service(client, dir.path()).extract(&files).await.unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedMimeType { .. }));
    }

    #[test]
    fn test_parse_strips_code_fence() {
        let record = parse_extraction_response(
            "```json\n{\"awards\": [{\"name\": \"数学竞赛\", \"year\": 3}]}\n```",
        )
        .unwrap();
        assert_eq!(record.section(SectionKey::Awards).len(), 1);
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        assert!(matches!(
            parse_extraction_response(r#"{"awards": {"name": "x"}}"#),
            Err(ExtractionError::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_extraction_response("[]"),
            Err(ExtractionError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_instruction_covers_all_sections() {
        let instruction = build_extraction_instruction();
        for section in SectionKey::ALL {
            assert!(instruction.contains(&format!("\"{}\"", section.client_key())));
        }
        assert!(instruction.contains("\"illnessAbsence\": integer"));
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(SourceFile::guess_mime_type("Scan.PDF"), Some("application/pdf"));
        assert_eq!(SourceFile::guess_mime_type("photo.jpeg"), Some("image/jpeg"));
        assert_eq!(SourceFile::guess_mime_type("README"), None);
    }
}
