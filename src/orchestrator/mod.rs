//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责把命令行请求落到具体流程上，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 管理应用生命周期（初始化、运行）
//! - 持有数据库和全部业务能力
//! - 为每个子命令驱动一次 `SubmissionFlow`
//!
//! ### `record_importer` - 批量档案导入器
//! - 扫描目录下的 TOML 档案
//! - 控制并发数量（Semaphore）
//! - 输出导入统计
//!
//! ## 层次关系
//!
//! ```text
//! app / record_importer
//!     ↓
//! workflow::SubmissionFlow (处理一次提交)
//!     ↓
//! services (能力层：extraction / record / draft)
//!     ↓
//! infrastructure (基础设施：Database / StagingArea)
//! ```
//!
//! ## 设计原则
//!
//! 1. **向下依赖**：编排层 → workflow → services → infrastructure
//! 2. **无业务逻辑**：只做调度和统计，步骤规则全部在 workflow

pub mod app;
pub mod record_importer;

// 重新导出主要类型
pub use app::App;
pub use record_importer::{import_folder, ImportStats};
