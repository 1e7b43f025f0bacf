//! # School Record Submit
//!
//! 学生档案录入与提交：手动填写或上传成绩单扫描件自动提取，核对后原子写入 SQLite。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源，只暴露能力
//! - `Database` - 唯一的 SQLite 连接，提供加锁取连接能力
//! - `StagingArea` - 上传文件的临时暂存，随作用域自动删除
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单份档案
//! - `ExtractionService` - 文档 → 档案的提取能力
//! - `RecordService` - 原子提交与读回能力
//! - `DraftService` - 每个学生一份草稿的读写能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次提交"的完整步骤
//! - `SessionCtx` - 上下文封装（owner + 编辑目标）
//! - `SubmissionFlow` - 状态机（方式选择 → 录入 → 提取 → 核对 → 提交）
//! - `Autosaver` - 草稿防抖自动保存
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/app` - 应用入口，为命令行子命令驱动流程
//! - `orchestrator/record_importer` - 批量导入 TOML 档案
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ExtractionError};
pub use infrastructure::Database;
pub use models::{GradeLevel, Owner, SchoolRecord, SectionKey, SubmissionMethod};
pub use orchestrator::App;
pub use workflow::{FlowServices, FlowState, SubmissionFlow};
