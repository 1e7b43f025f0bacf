//! 应用入口 - 编排层
//!
//! ## 职责
//!
//! 持有数据库和全部业务能力，为命令行的每个子命令提供一个方法。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：打开数据库、创建提取服务
//! 2. **单次提交**：文件提取提交、TOML 手动提交、编辑已有档案
//! 3. **草稿管理**：查看、恢复提交、丢弃
//! 4. **档案查询**：列表、读取、审核标记
//! 5. **批量导入**：委托 `record_importer`

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::Database;
use crate::models::loaders::load_toml_to_school_record;
use crate::models::record::{Draft, Owner, PersistedRecord, SchoolRecord, SubmissionMethod};
use crate::models::section::SectionKey;
use crate::orchestrator::record_importer::{self, ImportStats};
use crate::services::{ExtractionService, SourceFile};
use crate::utils::logging::log_startup;
use crate::workflow::{FlowServices, FlowState, SubmissionFlow};

/// 应用主结构
pub struct App {
    config: Config,
    services: FlowServices,
}

impl App {
    /// 初始化应用
    pub fn initialize(config: Config) -> Result<Self> {
        log_startup(&config);

        let db = Database::open(Path::new(&config.database_path))
            .with_context(|| format!("无法打开数据库: {}", config.database_path))?;
        let extraction = ExtractionService::new(&config);
        let services = FlowServices::new(db, extraction, config.autosave_debounce());

        Ok(Self { config, services })
    }

    /// 使用已构建的业务能力创建（测试用）
    pub fn with_services(config: Config, services: FlowServices) -> Self {
        Self { config, services }
    }

    pub fn services(&self) -> &FlowServices {
        &self.services
    }

    /// 上传文件、提取并提交
    pub async fn submit_files(
        &self,
        owner: Owner,
        method: SubmissionMethod,
        files: Vec<SourceFile>,
    ) -> Result<String> {
        if !method.is_file_based() {
            bail!("手动录入请使用 TOML 文件提交");
        }
        let mut flow = self.start_fresh(owner)?;
        let result: AppResult<String> = async {
            flow.select_method(method)?;
            flow.attach_files(files)?;
            flow.proceed().await?;
            log_review(flow.record());
            flow.submit().await
        }
        .await;
        flow.finish().await;
        Ok(result?)
    }

    /// 从 TOML 文件手动提交
    pub async fn submit_toml(&self, owner: Owner, path: &Path) -> Result<String> {
        let record = load_toml_to_school_record(path).await?;
        let mut flow = self.start_fresh(owner)?;
        let result: AppResult<String> = async {
            flow.select_method(SubmissionMethod::Manual)?;
            flow.replace_record(record)?;
            flow.proceed().await?;
            flow.submit().await
        }
        .await;
        close_file_session(flow, result.is_ok()).await;
        Ok(result?)
    }

    /// 用 TOML 文件的内容覆盖已有档案（未指定 id 时为最近一份）
    pub async fn edit_with_toml(&self, owner: Owner, record_id: Option<&str>, path: &Path) -> Result<String> {
        let record = load_toml_to_school_record(path).await?;
        let mut flow = SubmissionFlow::start_edit(self.services.clone(), owner, record_id)?;
        let result: AppResult<String> = async {
            flow.replace_record(record)?;
            flow.proceed().await?;
            flow.submit().await
        }
        .await;
        close_file_session(flow, result.is_ok()).await;
        Ok(result?)
    }

    /// 恢复草稿并直接提交
    pub async fn submit_draft(&self, owner: Owner) -> Result<String> {
        let mut flow = SubmissionFlow::start(self.services.clone(), owner);
        if flow.state() != FlowState::DraftPending {
            flow.finish().await;
            bail!("没有可恢复的草稿");
        }
        let result: AppResult<String> = async {
            flow.resume_draft()?;
            if flow.state() == FlowState::InputCapture {
                flow.proceed().await?;
            }
            flow.submit().await
        }
        .await;
        flow.finish().await;
        Ok(result?)
    }

    pub fn show_draft(&self, owner: &Owner) -> Result<Option<Draft>> {
        Ok(self.services.drafts.load(owner)?)
    }

    pub fn discard_draft(&self, owner: &Owner) -> Result<()> {
        self.services.drafts.discard(owner)?;
        info!("草稿已丢弃: {}", owner);
        Ok(())
    }

    pub fn list_records(&self, owner: &Owner) -> Result<Vec<PersistedRecord>> {
        Ok(self.services.records.list_records(owner)?)
    }

    /// 读取档案（未指定 id 时为最近一份）
    pub fn load_record(&self, owner: &Owner, record_id: Option<&str>) -> Result<Option<(PersistedRecord, SchoolRecord)>> {
        match record_id {
            Some(id) => Ok(Some(self.services.records.load_record(owner, id)?)),
            None => Ok(self.services.records.load_latest_for_edit(owner)?),
        }
    }

    pub fn set_verified(&self, record_id: &str, verified: bool) -> Result<()> {
        if !self.services.records.set_verified(record_id, verified)? {
            bail!("记录不存在: {}", record_id);
        }
        Ok(())
    }

    /// 批量导入目录下的 TOML 档案
    pub async fn import_folder(&self, folder: &str) -> Result<ImportStats> {
        record_importer::import_folder(&self.services, folder, self.config.max_concurrent_imports).await
    }

    fn start_fresh(&self, owner: Owner) -> Result<SubmissionFlow> {
        let flow = SubmissionFlow::start(self.services.clone(), owner);
        if flow.state() == FlowState::DraftPending {
            bail!("存在未完成的草稿，请先使用 `draft submit` 或 `draft discard`");
        }
        Ok(flow)
    }
}

/// TOML 文件本身就是输入，失败时不留草稿
async fn close_file_session(flow: SubmissionFlow, succeeded: bool) {
    if succeeded {
        flow.finish().await;
    } else {
        flow.abandon().await;
    }
}

fn log_review(record: &SchoolRecord) {
    for section in SectionKey::ALL {
        let rows = record.section(section).len();
        if rows > 0 {
            info!("  {} ({}): {} 行", section.label(), section, rows);
        }
    }
}
