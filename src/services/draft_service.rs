//! 草稿服务 - 业务能力层
//!
//! 每个所有者最多一份草稿，保存即整体覆盖。
//! 草稿错误不致命：调用方记录日志后继续。

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::infrastructure::Database;
use crate::models::record::{Draft, Owner, SchoolRecord, SubmissionMethod};

/// 草稿服务
#[derive(Clone)]
pub struct DraftService {
    db: Database,
}

impl DraftService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 保存草稿（整体覆盖）
    pub fn save(
        &self,
        owner: &Owner,
        method: SubmissionMethod,
        record: &SchoolRecord,
        reviewed: bool,
        edit_record_id: Option<&str>,
    ) -> AppResult<()> {
        let record_json = serde_json::to_string(record).map_err(AppError::draft)?;
        let now = timestamp();

        self.db
            .lock()
            .execute(
                "INSERT INTO record_drafts
                     (user_id, submission_type, record_json, reviewed, edit_record_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                     submission_type = excluded.submission_type,
                     record_json = excluded.record_json,
                     reviewed = excluded.reviewed,
                     edit_record_id = excluded.edit_record_id,
                     updated_at = excluded.updated_at",
                params![owner.id(), method.as_str(), record_json, reviewed, edit_record_id, now],
            )
            .map_err(AppError::draft)?;

        debug!("草稿已保存: 用户 {}，{} 行，{} 字节", owner, record.total_rows(), record_json.len());
        Ok(())
    }

    /// 读取草稿；没有草稿时返回 `None`
    pub fn load(&self, owner: &Owner) -> AppResult<Option<Draft>> {
        let row = self
            .db
            .lock()
            .query_row(
                "SELECT submission_type, record_json, reviewed, edit_record_id, updated_at
                 FROM record_drafts WHERE user_id = ?1",
                params![owner.id()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, bool>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(AppError::draft)?;

        let Some((method, record_json, reviewed, edit_record_id, updated_at)) = row else {
            return Ok(None);
        };

        let submission_method = method.parse::<SubmissionMethod>().map_err(AppError::draft)?;
        let record: SchoolRecord = serde_json::from_str(&record_json).map_err(AppError::draft)?;

        Ok(Some(Draft {
            submission_method,
            record,
            reviewed,
            edit_record_id,
            updated_at,
        }))
    }

    /// 丢弃草稿；没有草稿时同样成功
    pub fn discard(&self, owner: &Owner) -> AppResult<()> {
        let removed = self
            .db
            .lock()
            .execute("DELETE FROM record_drafts WHERE user_id = ?1", params![owner.id()])
            .map_err(AppError::draft)?;
        debug!("草稿已丢弃: 用户 {} ({} 条)", owner, removed);
        Ok(())
    }
}

/// 当前时间（RFC3339，微秒精度）
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
