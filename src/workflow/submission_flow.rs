//! 档案提交流程 - 流程层
//!
//! 核心职责：定义"一次提交"的完整步骤
//!
//! 流程顺序：
//! 1. 选择提交方式（有草稿时先决定恢复或丢弃）
//! 2. 录入：手动填写，或上传文件后自动提取
//! 3. 核对
//! 4. 原子提交，成功后删除草稿
//!
//! 编辑模式跳过方式选择，直接进入录入，提交时覆盖原记录。
//! 所有方法都是 `&mut self`，同一会话内不会出现并发修改。

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::Database;
use crate::models::record::{Draft, Owner, SchoolRecord, SubmissionMethod};
use crate::models::section::SectionKey;
use crate::services::{DraftService, ExtractionService, RecordService, SourceFile};
use crate::workflow::autosave::{Autosaver, DraftSnapshot};
use crate::workflow::session_ctx::SessionCtx;

/// 流程所在步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    MethodSelect,
    /// 存在未完成的草稿，等待恢复或丢弃
    DraftPending,
    InputCapture,
    Extracting,
    Review,
    Submitting,
    Done,
}

impl FlowState {
    pub fn name(self) -> &'static str {
        match self {
            FlowState::MethodSelect => "method_select",
            FlowState::DraftPending => "draft_pending",
            FlowState::InputCapture => "input_capture",
            FlowState::Extracting => "extracting",
            FlowState::Review => "review",
            FlowState::Submitting => "submitting",
            FlowState::Done => "done",
        }
    }
}

/// 流程依赖的业务能力
#[derive(Clone)]
pub struct FlowServices {
    pub extraction: ExtractionService,
    pub records: RecordService,
    pub drafts: DraftService,
    pub autosave_quiet_period: Duration,
}

impl FlowServices {
    pub fn new(db: Database, extraction: ExtractionService, autosave_quiet_period: Duration) -> Self {
        Self {
            extraction,
            records: RecordService::new(db.clone()),
            drafts: DraftService::new(db),
            autosave_quiet_period,
        }
    }
}

/// 档案提交流程
///
/// - 决定每一步允许做什么
/// - 持有正在编辑的档案和待提取的文件
/// - 不直接访问存储，只依赖业务能力（services）
pub struct SubmissionFlow {
    ctx: SessionCtx,
    services: FlowServices,
    autosave: Autosaver,
    state: FlowState,
    method: Option<SubmissionMethod>,
    record: SchoolRecord,
    files: Vec<SourceFile>,
    reviewed: bool,
    pending_draft: Option<Draft>,
    last_error: Option<String>,
    committed_record_id: Option<String>,
}

impl SubmissionFlow {
    /// 新建模式；存在草稿时进入 `DraftPending`
    ///
    /// 需要在 tokio 运行时内调用（会启动自动保存任务）。
    pub fn start(services: FlowServices, owner: Owner) -> Self {
        let pending_draft = match services.drafts.load(&owner) {
            Ok(draft) => draft,
            Err(e) => {
                warn!("⚠️ 读取草稿失败，按无草稿处理: {}", e);
                None
            }
        };

        let state = if pending_draft.is_some() {
            FlowState::DraftPending
        } else {
            FlowState::MethodSelect
        };

        let mut flow = Self::with_ctx(services, SessionCtx::new(owner), state);
        flow.pending_draft = pending_draft;
        info!("{} 开始提交流程，当前步骤: {}", flow.ctx, state.name());
        flow
    }

    /// 编辑模式：载入指定记录（未指定时取最近一份），直接进入录入
    pub fn start_edit(services: FlowServices, owner: Owner, record_id: Option<&str>) -> AppResult<Self> {
        let (parent, record) = match record_id {
            Some(id) => services.records.load_record(&owner, id)?,
            None => services
                .records
                .load_latest_for_edit(&owner)?
                .ok_or_else(|| AppError::NotFoundOrUnauthorized {
                    record_id: "latest".to_string(),
                })?,
        };

        let mut flow = Self::with_ctx(
            services,
            SessionCtx::editing(owner, parent.id),
            FlowState::InputCapture,
        );
        flow.method = Some(SubmissionMethod::Manual);
        flow.record = record;
        info!("{} 载入 {} 行，进入编辑", flow.ctx, flow.record.total_rows());
        Ok(flow)
    }

    fn with_ctx(services: FlowServices, ctx: SessionCtx, state: FlowState) -> Self {
        let autosave = Autosaver::spawn(
            services.drafts.clone(),
            ctx.owner.clone(),
            services.autosave_quiet_period,
        );
        Self {
            ctx,
            services,
            autosave,
            state,
            method: None,
            record: SchoolRecord::new(),
            files: Vec::new(),
            reviewed: false,
            pending_draft: None,
            last_error: None,
            committed_record_id: None,
        }
    }

    // ========== 查询 ==========

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn ctx(&self) -> &SessionCtx {
        &self.ctx
    }

    pub fn method(&self) -> Option<SubmissionMethod> {
        self.method
    }

    pub fn record(&self) -> &SchoolRecord {
        &self.record
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn pending_draft(&self) -> Option<&Draft> {
        self.pending_draft.as_ref()
    }

    /// 最近一次失败的信息（提取或提交失败后展示给用户）
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn committed_record_id(&self) -> Option<&str> {
        self.committed_record_id.as_deref()
    }

    // ========== 草稿 ==========

    /// 恢复草稿
    pub fn resume_draft(&mut self) -> AppResult<()> {
        self.expect_state(&[FlowState::DraftPending], "resume_draft")?;
        let draft = self.pending_draft.take().ok_or(AppError::InvalidTransition {
            state: self.state.name(),
            action: "resume_draft",
        })?;

        let to_review =
            draft.reviewed || (draft.submission_method.is_file_based() && draft.record.has_content());

        self.method = Some(draft.submission_method);
        self.record = draft.record;
        self.reviewed = draft.reviewed;
        self.ctx.edit_record_id = draft.edit_record_id;
        self.state = if to_review {
            FlowState::Review
        } else {
            FlowState::InputCapture
        };

        info!("{} 📝 恢复草稿 ({} 行) → {}", self.ctx, self.record.total_rows(), self.state.name());
        Ok(())
    }

    /// 丢弃草稿，从头开始
    pub fn discard_draft(&mut self) -> AppResult<()> {
        self.expect_state(&[FlowState::DraftPending], "discard_draft")?;
        self.pending_draft = None;
        if let Err(e) = self.services.drafts.discard(&self.ctx.owner) {
            warn!("⚠️ 删除草稿失败: {}", e);
        }
        self.state = FlowState::MethodSelect;
        Ok(())
    }

    /// 立即保存草稿（跳过安静期）
    pub async fn save_draft_now(&mut self) -> bool {
        if self.method.is_none() || matches!(self.state, FlowState::Done) {
            return false;
        }
        self.emit_change();
        self.autosave.flush().await
    }

    // ========== 录入 ==========

    pub fn select_method(&mut self, method: SubmissionMethod) -> AppResult<()> {
        self.expect_state(&[FlowState::MethodSelect], "select_method")?;
        self.method = Some(method);
        self.files.clear();
        self.last_error = None;
        self.state = FlowState::InputCapture;
        info!("{} 选择提交方式: {}", self.ctx, method);
        Ok(())
    }

    /// 添加待提取的文件（仅 pdf / image 方式）
    pub fn attach_files(&mut self, files: Vec<SourceFile>) -> AppResult<()> {
        self.expect_state(&[FlowState::InputCapture], "attach_files")?;
        if !self.method.is_some_and(SubmissionMethod::is_file_based) {
            return Err(AppError::validation("当前提交方式不接受文件"));
        }
        self.files.extend(files);
        Ok(())
    }

    pub fn clear_files(&mut self) -> AppResult<()> {
        self.expect_state(&[FlowState::InputCapture], "clear_files")?;
        self.files.clear();
        Ok(())
    }

    pub fn add_row(&mut self, section: SectionKey, fields: BTreeMap<String, JsonValue>) -> AppResult<String> {
        self.expect_editable("add_row")?;
        let id = self.record.add_row(section, fields);
        self.emit_change();
        Ok(id)
    }

    /// 修改单个字段；行不存在时返回 false
    pub fn update_field(
        &mut self,
        section: SectionKey,
        row_id: &str,
        field: &str,
        value: JsonValue,
    ) -> AppResult<bool> {
        self.expect_editable("update_field")?;
        let updated = self.record.update_field(section, row_id, field, value);
        if updated {
            self.emit_change();
        }
        Ok(updated)
    }

    pub fn remove_row(&mut self, section: SectionKey, row_id: &str) -> AppResult<bool> {
        self.expect_editable("remove_row")?;
        let removed = self.record.remove_row(section, row_id);
        if removed {
            self.emit_change();
        }
        Ok(removed)
    }

    /// 整体替换正在编辑的档案（如从 TOML 导入）
    pub fn replace_record(&mut self, record: SchoolRecord) -> AppResult<()> {
        self.expect_editable("replace_record")?;
        self.record = record;
        self.emit_change();
        Ok(())
    }

    // ========== 步骤推进 ==========

    /// 从录入进入核对
    ///
    /// 文件方式且有待提取文件时先运行提取；否则要求档案至少有一行内容。
    pub async fn proceed(&mut self) -> AppResult<()> {
        self.expect_state(&[FlowState::InputCapture], "proceed")?;
        let method = self.method.ok_or_else(|| AppError::validation("未选择提交方式"))?;
        self.last_error = None;

        if method.is_file_based() && !self.files.is_empty() {
            return self.run_extraction().await;
        }
        if self.record.has_content() {
            self.enter_review();
            return Ok(());
        }

        let reason = if method.is_file_based() {
            "请先上传至少一个文件"
        } else {
            "请至少填写一行内容"
        };
        self.fail(AppError::validation(reason))
    }

    /// 提取失败后由用户手动重试
    pub async fn retry_extraction(&mut self) -> AppResult<()> {
        self.expect_state(&[FlowState::InputCapture], "retry_extraction")?;
        if !self.method.is_some_and(SubmissionMethod::is_file_based) || self.files.is_empty() {
            return Err(AppError::validation("没有可重新提取的文件"));
        }
        self.last_error = None;
        self.run_extraction().await
    }

    /// 返回上一步
    pub fn back(&mut self) -> AppResult<()> {
        match self.state {
            FlowState::InputCapture if !self.ctx.is_edit_mode() => {
                self.state = FlowState::MethodSelect;
            }
            FlowState::Review => {
                self.state = FlowState::InputCapture;
            }
            state => {
                return Err(AppError::InvalidTransition {
                    state: state.name(),
                    action: "back",
                })
            }
        }
        self.last_error = None;
        Ok(())
    }

    /// 提交核对后的档案
    ///
    /// 成功后删除草稿；删除失败只记录日志。
    pub async fn submit(&mut self) -> AppResult<String> {
        self.expect_state(&[FlowState::Review], "submit")?;
        let method = self.method.ok_or_else(|| AppError::validation("未选择提交方式"))?;

        self.state = FlowState::Submitting;
        self.last_error = None;

        let result = self.services.records.submit(
            &self.ctx.owner,
            method,
            &self.record,
            self.ctx.edit_record_id.as_deref(),
        );

        match result {
            Ok(record_id) => {
                self.autosave.cancel().await;
                if let Err(e) = self.services.drafts.discard(&self.ctx.owner) {
                    warn!("⚠️ 提交成功但删除草稿失败: {}", e);
                }
                self.state = FlowState::Done;
                self.committed_record_id = Some(record_id.clone());
                info!("{} ✅ 提交完成: {}", self.ctx, record_id);
                Ok(record_id)
            }
            Err(e) => {
                error!("{} ❌ 提交失败: {}", self.ctx, e);
                self.state = FlowState::Review;
                self.fail(e)
            }
        }
    }

    /// 结束会话，保存尚未落盘的草稿
    pub async fn finish(self) {
        self.autosave.shutdown().await;
    }

    /// 结束会话并放弃尚未落盘的修改；已经保存的草稿不受影响
    pub async fn abandon(self) {
        self.autosave.cancel().await;
        self.autosave.shutdown().await;
    }

    // ========== 内部 ==========

    async fn run_extraction(&mut self) -> AppResult<()> {
        self.state = FlowState::Extracting;
        info!("{} 🤖 开始提取 {} 个文件", self.ctx, self.files.len());

        match self.services.extraction.extract(&self.files).await {
            Ok(record) => {
                self.record = record;
                self.files.clear();
                self.enter_review();
                Ok(())
            }
            Err(e) => {
                error!("{} ❌ 提取失败: {}", self.ctx, e);
                self.state = FlowState::InputCapture;
                self.fail(AppError::Extraction(e))
            }
        }
    }

    fn enter_review(&mut self) {
        self.state = FlowState::Review;
        self.reviewed = true;
        self.emit_change();
        info!("{} 进入核对，共 {} 行", self.ctx, self.record.total_rows());
    }

    fn emit_change(&self) {
        if let Some(method) = self.method {
            self.autosave.changed(DraftSnapshot {
                method,
                record: self.record.clone(),
                reviewed: self.reviewed,
                edit_record_id: self.ctx.edit_record_id.clone(),
            });
        }
    }

    fn fail<T>(&mut self, err: AppError) -> AppResult<T> {
        self.last_error = Some(err.to_string());
        Err(err)
    }

    fn expect_state(&self, allowed: &[FlowState], action: &'static str) -> AppResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition {
                state: self.state.name(),
                action,
            })
        }
    }

    fn expect_editable(&self, action: &'static str) -> AppResult<()> {
        self.expect_state(&[FlowState::InputCapture, FlowState::Review], action)
    }
}
