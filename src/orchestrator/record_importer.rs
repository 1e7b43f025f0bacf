//! 批量档案导入器 - 编排层
//!
//! ## 职责
//!
//! 把一个目录下的 TOML 档案逐个走一遍手动提交流程。
//! 文件名（不含扩展名）即学生 id，每个文件生成一份新档案。
//!
//! ## 核心功能
//!
//! 1. **批量加载**：扫描目录下所有 `.toml` 文件
//! 2. **并发控制**：使用 Semaphore 限制同时进行的提交数量
//! 3. **草稿保护**：学生有未完成的草稿时跳过，不覆盖
//! 4. **统计输出**：汇总成功/失败数量

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::loaders::load_all_toml_records;
use crate::models::record::{Owner, SchoolRecord, SubmissionMethod};
use crate::utils::logging::{log_import_start, print_final_stats};
use crate::workflow::{FlowServices, FlowState, SubmissionFlow};

/// 导入统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// 导入目录下的全部档案
pub async fn import_folder(
    services: &FlowServices,
    folder: &str,
    max_concurrent: usize,
) -> Result<ImportStats> {
    let records = load_all_toml_records(folder).await?;
    let mut stats = ImportStats {
        total: records.len(),
        ..Default::default()
    };

    if records.is_empty() {
        warn!("⚠️ 没有找到待导入的TOML文件");
        return Ok(stats);
    }

    log_import_start(records.len(), folder);

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles = Vec::new();

    for (path, loaded) in records {
        let record = match loaded {
            Ok(record) => record,
            Err(e) => {
                error!("❌ 无法解析档案文件: {} ({:#})", path.display(), e);
                stats.failed += 1;
                continue;
            }
        };
        let owner = match owner_from_path(&path) {
            Ok(owner) => owner,
            Err(e) => {
                error!("❌ 无法从文件名确定学生: {} ({})", path.display(), e);
                stats.failed += 1;
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await?;
        let services = services.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            import_one(services, owner, record).await
        });
        handles.push((path, handle));
    }

    for (path, handle) in handles {
        match handle.await {
            Ok(Ok(record_id)) => {
                info!("✓ {} → {}", path.display(), record_id);
                stats.success += 1;
            }
            Ok(Err(e)) => {
                error!("❌ 导入失败 {}: {}", path.display(), e);
                stats.failed += 1;
            }
            Err(e) => {
                error!("❌ 导入任务执行失败 {}: {}", path.display(), e);
                stats.failed += 1;
            }
        }
    }

    print_final_stats(stats.success, stats.failed, stats.total);
    Ok(stats)
}

/// 以手动方式提交一份档案
pub async fn import_one(services: FlowServices, owner: Owner, record: SchoolRecord) -> AppResult<String> {
    let mut flow = SubmissionFlow::start(services, owner);

    if flow.state() == FlowState::DraftPending {
        flow.finish().await;
        return Err(AppError::validation("学生有未完成的草稿，跳过导入"));
    }

    let result = submit_manual(&mut flow, record).await;
    // 失败后修正文件重新导入即可，不留草稿
    if result.is_ok() {
        flow.finish().await;
    } else {
        flow.abandon().await;
    }
    result
}

async fn submit_manual(flow: &mut SubmissionFlow, record: SchoolRecord) -> AppResult<String> {
    flow.select_method(SubmissionMethod::Manual)?;
    flow.replace_record(record)?;
    flow.proceed().await?;
    flow.submit().await
}

fn owner_from_path(path: &Path) -> AppResult<Owner> {
    let stem = path.file_stem().and_then(|s| s.to_str());
    Owner::authenticate(stem)
}
