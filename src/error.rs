//! 错误类型
//!
//! 按来源划分：提取服务、校验、持久化、草稿、状态机、配置。
//! 提取与提交错误会返回给状态机展示并允许用户手动重试；
//! 草稿错误只记录日志，不向最终用户暴露。

use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 没有已认证的所有者
    #[error("需要登录后才能操作")]
    AuthenticationRequired,

    /// 提取服务错误
    #[error("提取失败: {0}")]
    Extraction(#[from] ExtractionError),

    /// 提交前校验失败（缺少提交方式或记录为空）
    #[error("校验失败: {reason}")]
    ValidationFailed { reason: String },

    /// 编辑模式下目标记录不存在或不属于当前用户
    #[error("记录不存在或无权访问: {record_id}")]
    NotFoundOrUnauthorized { record_id: String },

    /// 事务级提交失败，可原样重新提交
    #[error("持久化失败: {source}")]
    PersistenceFailure {
        #[source]
        source: rusqlite::Error,
    },

    /// 草稿读写失败（非致命）
    #[error("草稿持久化失败: {message}")]
    DraftPersistenceFailure { message: String },

    /// 状态机中不允许的转换
    #[error("当前步骤 {state} 不允许执行: {action}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// 提取服务错误
///
/// 每种错误对单次尝试都是终态，内部不做重试。
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// 服务未配置（缺少 API key）
    #[error("提取服务未配置")]
    Unavailable,

    /// 服务返回为空
    #[error("提取服务返回为空 (模型: {model})")]
    EmptyResponse { model: String },

    /// 返回内容不是 JSON 或结构不符
    #[error("提取结果格式错误: {reason}")]
    MalformedResponse { reason: String },

    /// 认证失败
    #[error("提取服务认证失败: {message}")]
    AuthFailed { message: String },

    /// 配额或频率超限
    #[error("提取服务配额已用尽: {message}")]
    QuotaExceeded { message: String },

    /// 其他请求失败
    #[error("提取服务请求失败: {message}")]
    RequestFailed { message: String },

    /// 超时
    #[error("提取服务在 {seconds} 秒内未返回")]
    Timeout { seconds: u64 },

    /// 不支持的文件类型
    #[error("不支持的文件类型: {mime_type} ({file_name})")]
    UnsupportedMimeType {
        file_name: String,
        mime_type: String,
    },

    /// 本地暂存文件读写失败
    #[error("暂存文件失败 ({file_name}): {source}")]
    StagingFailed {
        file_name: String,
        #[source]
        source: std::io::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },

    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 配置文件解析失败
    #[error("解析配置文件失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::PersistenceFailure { source: err }
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建校验失败错误
    pub fn validation(reason: impl Into<String>) -> Self {
        AppError::ValidationFailed {
            reason: reason.into(),
        }
    }

    /// 创建草稿持久化错误
    pub fn draft(source: impl std::fmt::Display) -> Self {
        AppError::DraftPersistenceFailure {
            message: source.to_string(),
        }
    }

    /// 是否应该提示用户重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Extraction(_) | AppError::PersistenceFailure { .. }
        )
    }
}

impl ExtractionError {
    /// 创建格式错误
    pub fn malformed(reason: impl Into<String>) -> Self {
        ExtractionError::MalformedResponse {
            reason: reason.into(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

/// 提取服务结果类型
pub type ExtractionResult<T> = Result<T, ExtractionError>;
