use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite 数据库文件路径
    pub database_path: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- LLM 提取服务配置 ---
    /// 为空时提取服务视为未配置
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    /// 提取请求超时（秒），多文件文档需要较长时间
    pub extraction_timeout_secs: u64,
    // --- 草稿配置 ---
    /// 自动保存防抖间隔（毫秒）
    pub autosave_debounce_ms: u64,
    /// 上传文件暂存目录，为空时使用系统临时目录
    pub staging_dir: String,
    // --- 批量导入配置 ---
    /// 同时导入的档案数
    pub max_concurrent_imports: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "school_records.sqlite3".to_string(),
            verbose_logging: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o".to_string(),
            extraction_timeout_secs: 300,
            autosave_debounce_ms: 2000,
            staging_dir: String::new(),
            max_concurrent_imports: 4,
        }
    }
}

impl Config {
    /// 从环境变量加载，缺失的项使用默认值
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env()
    }

    /// 从 TOML 文件加载，再用环境变量覆盖
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        parse_toml(&content, path)?.overlay_env()
    }

    fn overlay_env(self) -> Result<Self, ConfigError> {
        Ok(Self {
            database_path: std::env::var("DATABASE_PATH").unwrap_or(self.database_path),
            verbose_logging: parse_env("VERBOSE_LOGGING", "bool")?.unwrap_or(self.verbose_logging),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name),
            extraction_timeout_secs: parse_env("EXTRACTION_TIMEOUT_SECS", "u64")?
                .unwrap_or(self.extraction_timeout_secs),
            autosave_debounce_ms: parse_env("AUTOSAVE_DEBOUNCE_MS", "u64")?
                .unwrap_or(self.autosave_debounce_ms),
            staging_dir: std::env::var("STAGING_DIR").unwrap_or(self.staging_dir),
            max_concurrent_imports: parse_env("MAX_CONCURRENT_IMPORTS", "usize")?
                .unwrap_or(self.max_concurrent_imports),
        })
    }

    /// 提取服务是否已配置
    pub fn extraction_configured(&self) -> bool {
        !self.llm_api_key.trim().is_empty()
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

fn parse_toml(content: &str, path: &Path) -> Result<Config, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::TomlParseFailed {
        path: path.display().to_string(),
        source,
    })
}

fn parse_env<T: std::str::FromStr>(
    var_name: &str,
    expected_type: &str,
) -> Result<Option<T>, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_has_no_api_key() {
        let config = Config::default();
        assert!(!config.extraction_configured());
        assert_eq!(config.autosave_debounce(), Duration::from_millis(2000));
    }

    #[test]
    fn test_toml_partial_file_keeps_defaults() {
        let content = "llm_model_name = \"vision-test\"\nextraction_timeout_secs = 600\n";

        let config = parse_toml(content, Path::new("config.toml")).unwrap();
        assert_eq!(config.llm_model_name, "vision-test");
        assert_eq!(config.extraction_timeout_secs, 600);
        assert_eq!(config.autosave_debounce_ms, 2000);
        assert_eq!(config.database_path, "school_records.sqlite3");
    }

    #[test]
    fn test_toml_parse_error_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "extraction_timeout_secs = \"soon\"").unwrap();

        let err = Config::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParseFailed { .. }));
    }
}
