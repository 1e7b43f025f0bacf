//! LLM 提取客户端
//!
//! 通过兼容 OpenAI 的 chat completion 接口完成文档理解。
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 图片以 data URL 作为 image_url 内容块发送，PDF 作为 file 内容块发送
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini 等）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartFile,
        ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, FileObject,
        ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::{ExtractionClient, UploadedFile};
use crate::config::Config;
use crate::error::{ExtractionError, ExtractionResult};
use crate::infrastructure::StagedFile;

const SYSTEM_MESSAGE: &str = "你是一个专业的学生档案识别助手，擅长从成绩单、学生档案的扫描件和照片中准确提取结构化数据。\
                              你只输出符合要求的 JSON，不输出任何解释。";

/// LLM 提取客户端
pub struct LlmExtractionClient {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl LlmExtractionClient {
    /// 创建新的客户端
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
        }
    }

    fn build_messages(
        &self,
        files: &[UploadedFile],
        instruction: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, async_openai::error::OpenAIError> {
        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_MESSAGE)
            .build()?;

        let mut content_parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
        content_parts.push(ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartText {
                text: instruction.to_string(),
            },
        ));
        for file in files {
            content_parts.push(content_part(file)?);
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()?;

        Ok(vec![
            ChatCompletionRequestMessage::System(system_msg),
            ChatCompletionRequestMessage::User(user_msg),
        ])
    }
}

/// PDF 作为文件内容块发送，其余按图片发送
fn content_part(
    file: &UploadedFile,
) -> Result<ChatCompletionRequestUserMessageContentPart, async_openai::error::OpenAIError> {
    if file.mime_type != "application/pdf" {
        return Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
            ChatCompletionRequestMessageContentPartImage {
                image_url: ImageUrl {
                    url: file.uri.clone(),
                    detail: Some(ImageDetail::High),
                },
            },
        ));
    }

    // FileObject 的字段不公开，只能经由反序列化构造
    let file_object: FileObject = serde_json::from_value(serde_json::json!({
        "file_data": file.uri,
        "filename": file.file_name,
    }))
    .map_err(|e| async_openai::error::OpenAIError::InvalidArgument(e.to_string()))?;

    Ok(ChatCompletionRequestUserMessageContentPart::File(
        ChatCompletionRequestMessageContentPartFile { file: file_object },
    ))
}

#[async_trait]
impl ExtractionClient for LlmExtractionClient {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn upload(&self, file: &StagedFile) -> ExtractionResult<UploadedFile> {
        let uri = file
            .to_data_url()
            .await
            .map_err(|source| ExtractionError::StagingFailed {
                file_name: file.file_name.clone(),
                source,
            })?;

        debug!("已上传 {} ({}, {} 字节)", file.file_name, file.mime_type, file.size);

        Ok(UploadedFile {
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            uri,
        })
    }

    async fn generate(
        &self,
        files: &[UploadedFile],
        instruction: &str,
    ) -> ExtractionResult<Option<String>> {
        debug!("调用 LLM API，模型: {}，文件数: {}", self.model_name, files.len());

        let messages = self
            .build_messages(files, instruction)
            .map_err(|e| classify_api_error(&e.to_string()))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(16384u32)
            .build()
            .map_err(|e| classify_api_error(&e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            classify_api_error(&e.to_string())
        })?;

        debug!("LLM API 调用成功");

        Ok(response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty()))
    }
}

/// 按错误信息归类 API 错误
pub fn classify_api_error(message: &str) -> ExtractionError {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "invalid_api_key",
        "incorrect api key",
        "unauthorized",
        "authentication",
        "permission_denied",
        "401",
        "403",
    ]) {
        ExtractionError::AuthFailed {
            message: message.to_string(),
        }
    } else if has(&[
        "insufficient_quota",
        "quota",
        "rate limit",
        "rate_limit",
        "resource_exhausted",
        "429",
    ]) {
        ExtractionError::QuotaExceeded {
            message: message.to_string(),
        }
    } else {
        ExtractionError::RequestFailed {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::StagingArea;

    fn create_test_client() -> LlmExtractionClient {
        let config = Config {
            llm_api_key: "test-key".to_string(),
            llm_api_base_url: "http://127.0.0.1:9/v1".to_string(),
            llm_model_name: "vision-test".to_string(),
            ..Config::default()
        };
        LlmExtractionClient::new(&config)
    }

    #[test]
    fn test_classify_auth_errors() {
        assert!(matches!(
            classify_api_error("Incorrect API key provided: sk-***"),
            ExtractionError::AuthFailed { .. }
        ));
        assert!(matches!(
            classify_api_error("status 401 Unauthorized"),
            ExtractionError::AuthFailed { .. }
        ));
    }

    #[test]
    fn test_classify_quota_errors() {
        assert!(matches!(
            classify_api_error("You exceeded your current quota, please check your plan"),
            ExtractionError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify_api_error("RESOURCE_EXHAUSTED"),
            ExtractionError::QuotaExceeded { .. }
        ));
    }

    #[test]
    fn test_classify_other_errors() {
        assert!(matches!(
            classify_api_error("error sending request: connection refused"),
            ExtractionError::RequestFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_upload_builds_data_url() {
        let client = create_test_client();
        let staged = StagingArea::default()
            .stage("page1.jpg", "image/jpeg", b"jpeg")
            .await
            .unwrap();

        let uploaded = client.upload(&staged).await.unwrap();
        assert_eq!(uploaded.file_name, "page1.jpg");
        assert!(uploaded.uri.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_build_messages_attaches_every_file() {
        let client = create_test_client();
        let files = vec![
            UploadedFile {
                file_name: "a.png".into(),
                mime_type: "image/png".into(),
                uri: "data:image/png;base64,AA==".into(),
            },
            UploadedFile {
                file_name: "b.pdf".into(),
                mime_type: "application/pdf".into(),
                uri: "data:application/pdf;base64,AA==".into(),
            },
        ];

        let messages = client.build_messages(&files, "提取").unwrap();
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            ChatCompletionRequestMessage::User(user) => match &user.content {
                ChatCompletionRequestUserMessageContent::Array(parts) => {
                    assert_eq!(parts.len(), 3);
                    assert!(matches!(
                        parts[0],
                        ChatCompletionRequestUserMessageContentPart::Text(_)
                    ));
                    match &parts[1] {
                        ChatCompletionRequestUserMessageContentPart::ImageUrl(image) => {
                            assert_eq!(image.image_url.url, "data:image/png;base64,AA==");
                        }
                        other => panic!("图片应作为 image_url 发送: {:?}", other),
                    }
                    match &parts[2] {
                        ChatCompletionRequestUserMessageContentPart::File(part) => {
                            let json = serde_json::to_value(&part.file).unwrap();
                            assert_eq!(json["file_data"], "data:application/pdf;base64,AA==");
                            assert_eq!(json["filename"], "b.pdf");
                        }
                        other => panic!("PDF 应作为文件内容块发送: {:?}", other),
                    }
                }
                _ => panic!("用户消息应为多部分内容"),
            },
            _ => panic!("第二条消息应为用户消息"),
        }
    }

    /// 真实 API 调用
    ///
    /// 运行方式：
    /// ```bash
    /// LLM_API_KEY=... cargo test test_generate_live -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_generate_live() {
        let _ = tracing_subscriber::fmt::try_init();
        let config = Config::from_env().unwrap();
        let client = LlmExtractionClient::new(&config);

        let result = client.generate(&[], "只返回 {\"ok\": true}").await;
        println!("{:?}", result);
        assert!(result.is_ok());
    }
}
