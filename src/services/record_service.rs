//! 档案服务 - 业务能力层
//!
//! 只负责"把一份档案原子地写入存储 / 从存储读回"能力，不关心流程。
//!
//! 提交在一个 SQLite 事务内完成：
//! 1. 编辑模式下校验目标记录存在且属于当前用户
//! 2. 写入（或更新）父记录
//! 3. 11 个分区依次"删除旧行 + 按顺序插入新行"
//!
//! 任一步失败，事务随 `Transaction` 的 drop 回滚，存储保持提交前的状态。

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use crate::error::{AppError, AppResult};
use crate::infrastructure::database::read_field;
use crate::infrastructure::Database;
use crate::models::grade::{derive_grade_level, GradeLevel};
use crate::models::record::{Owner, PersistedRecord, SchoolRecord, SubmissionMethod};
use crate::models::section::{to_client, FieldValue, SectionKey, StorageRow, StorageSections};
use crate::services::draft_service::timestamp;

static NULL_VALUE: FieldValue = FieldValue::Null;

/// 一次提交的全部内容
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub owner: Owner,
    pub method: SubmissionMethod,
    pub grade_level: GradeLevel,
    /// 存储形态的 11 个分区；缺失的分区按空处理
    pub sections: StorageSections,
    /// 编辑模式下的目标记录
    pub existing_record_id: Option<String>,
}

/// 档案服务
#[derive(Clone)]
pub struct RecordService {
    db: Database,
}

impl RecordService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 校验、推导年级并提交
    ///
    /// # 返回
    /// 写入的记录 id（编辑模式下即原 id）
    pub fn submit(
        &self,
        owner: &Owner,
        method: SubmissionMethod,
        record: &SchoolRecord,
        existing_record_id: Option<&str>,
    ) -> AppResult<String> {
        if !record.has_content() {
            return Err(AppError::validation("档案为空，至少需要一行内容"));
        }

        let grade_level = derive_grade_level(record);
        info!(
            "📤 提交档案: 用户 {}，方式 {}，{} 行，年级 {}",
            owner,
            method,
            record.total_rows(),
            grade_level
        );

        self.commit(CommitRequest {
            owner: owner.clone(),
            method,
            grade_level,
            sections: record.to_storage_sections(),
            existing_record_id: existing_record_id.map(str::to_string),
        })
    }

    /// 原子提交
    pub fn commit(&self, request: CommitRequest) -> AppResult<String> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = timestamp();

        let record_id = match &request.existing_record_id {
            Some(id) => {
                let owner_id: Option<String> = tx
                    .query_row(
                        "SELECT user_id FROM school_records WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if owner_id.as_deref() != Some(request.owner.id()) {
                    error!("❌ 记录 {} 不存在或不属于用户 {}", id, request.owner);
                    return Err(AppError::NotFoundOrUnauthorized {
                        record_id: id.clone(),
                    });
                }
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        tx.execute(
            "INSERT INTO school_records
                 (id, user_id, submission_type, grade_level, is_verified, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 submission_type = excluded.submission_type,
                 grade_level = excluded.grade_level,
                 is_verified = 0,
                 updated_at = excluded.updated_at",
            params![
                record_id,
                request.owner.id(),
                request.method.as_str(),
                request.grade_level.as_str(),
                now
            ],
        )?;

        for section in SectionKey::ALL {
            let rows = request
                .sections
                .get(&section)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            replace_section(&tx, &record_id, section, rows)?;
        }

        tx.commit()?;
        info!("✅ 档案已提交: {}", record_id);
        Ok(record_id)
    }

    /// 读取当前用户最近更新的一份档案，行 id 重新分配
    pub fn load_latest_for_edit(&self, owner: &Owner) -> AppResult<Option<(PersistedRecord, SchoolRecord)>> {
        let conn = self.db.lock();
        let parent = conn
            .query_row(
                &format!(
                    "{} WHERE user_id = ?1 ORDER BY updated_at DESC, rowid DESC LIMIT 1",
                    PARENT_SELECT
                ),
                params![owner.id()],
                read_parent,
            )
            .optional()?;

        match parent {
            Some(parent) => {
                let record = load_sections(&conn, &parent.id)?;
                debug!("载入档案 {}: {} 行", parent.id, record.total_rows());
                Ok(Some((parent, record)))
            }
            None => Ok(None),
        }
    }

    /// 读取指定档案；不存在或不属于当前用户时返回 `NotFoundOrUnauthorized`
    pub fn load_record(&self, owner: &Owner, record_id: &str) -> AppResult<(PersistedRecord, SchoolRecord)> {
        let conn = self.db.lock();
        let parent = conn
            .query_row(
                &format!("{} WHERE id = ?1 AND user_id = ?2", PARENT_SELECT),
                params![record_id, owner.id()],
                read_parent,
            )
            .optional()?
            .ok_or_else(|| AppError::NotFoundOrUnauthorized {
                record_id: record_id.to_string(),
            })?;

        let record = load_sections(&conn, &parent.id)?;
        Ok((parent, record))
    }

    /// 当前用户的全部档案，最新的在前
    pub fn list_records(&self, owner: &Owner) -> AppResult<Vec<PersistedRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY updated_at DESC, rowid DESC",
            PARENT_SELECT
        ))?;
        let records = stmt
            .query_map(params![owner.id()], read_parent)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// 设置审核标记（由审核人员调用）；记录不存在时返回 false
    pub fn set_verified(&self, record_id: &str, verified: bool) -> AppResult<bool> {
        let updated = self.db.lock().execute(
            "UPDATE school_records SET is_verified = ?2 WHERE id = ?1",
            params![record_id, verified],
        )?;
        if updated > 0 {
            info!("记录 {} 审核标记: {}", record_id, verified);
        }
        Ok(updated > 0)
    }

    /// 某条记录某个分区的行数
    pub fn section_row_count(&self, record_id: &str, section: SectionKey) -> AppResult<usize> {
        let count: i64 = self.db.lock().query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE school_record_id = ?1",
                section.table()
            ),
            params![record_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }
}

const PARENT_SELECT: &str = "SELECT id, user_id, submission_type, grade_level, is_verified, created_at, updated_at
                             FROM school_records";

fn read_parent(r: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedRecord> {
    Ok(PersistedRecord {
        id: r.get("id")?,
        owner_id: r.get("user_id")?,
        submission_method: r.get("submission_type")?,
        grade_level: r.get("grade_level")?,
        is_verified: r.get("is_verified")?,
        created_at: r.get("created_at")?,
        updated_at: r.get("updated_at")?,
    })
}

/// 删除某分区的旧行并按顺序插入新行
fn replace_section(
    conn: &Connection,
    record_id: &str,
    section: SectionKey,
    rows: &[StorageRow],
) -> rusqlite::Result<()> {
    let table = section.table();
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE school_record_id = ?1", table),
        params![record_id],
    )?;

    if rows.is_empty() {
        if removed > 0 {
            debug!("{}: 清空 {} 行", table, removed);
        }
        return Ok(());
    }

    let specs = section.fields();
    let columns: Vec<&str> = specs.iter().map(|f| f.storage).collect();
    let placeholders: Vec<String> = (1..=specs.len() + 2).map(|i| format!("?{}", i)).collect();
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {} (school_record_id, sort_order, {}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    ))?;

    for (idx, row) in rows.iter().enumerate() {
        let sort_order = idx as i64;
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(specs.len() + 2);
        values.push(&record_id);
        values.push(&sort_order);
        for spec in specs {
            values.push(row.get(spec.storage).unwrap_or(&NULL_VALUE));
        }
        stmt.execute(params_from_iter(values))?;
    }

    debug!("{}: 替换 {} 行为 {} 行", table, removed, rows.len());
    Ok(())
}

/// 读回 11 个分区，转换为客户端形态
fn load_sections(conn: &Connection, record_id: &str) -> rusqlite::Result<SchoolRecord> {
    let mut record = SchoolRecord::new();

    for section in SectionKey::ALL {
        let specs = section.fields();
        let columns: Vec<&str> = specs.iter().map(|f| f.storage).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE school_record_id = ?1 ORDER BY sort_order, id",
            columns.join(", "),
            section.table()
        ))?;

        let rows = stmt
            .query_map(params![record_id], |r| {
                let mut values = BTreeMap::new();
                for spec in specs {
                    values.insert(spec.storage, read_field(r, spec.storage, spec.kind)?);
                }
                Ok(StorageRow { values })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        *record.section_mut(section) = rows.iter().map(|row| to_client(row, section)).collect();
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn service() -> RecordService {
        RecordService::new(Database::open_in_memory().unwrap())
    }

    fn owner(id: &str) -> Owner {
        Owner::authenticate(Some(id)).unwrap()
    }

    fn awards(count: usize) -> SchoolRecord {
        let mut record = SchoolRecord::new();
        for i in 0..count {
            record.add_row(
                SectionKey::Awards,
                [
                    ("year".to_string(), json!(1)),
                    ("name".to_string(), json!(format!("奖项 {}", i + 1))),
                ]
                .into_iter()
                .collect(),
            );
        }
        record
    }

    fn with_volunteer_and_subjects(mut record: SchoolRecord) -> SchoolRecord {
        record.add_row(
            SectionKey::VolunteerActivities,
            [("hours".to_string(), json!(4.5))].into_iter().collect(),
        );
        record.add_row(
            SectionKey::GeneralSubjects,
            [
                ("year".to_string(), json!(2)),
                ("subject".to_string(), json!("物理")),
            ]
            .into_iter()
            .collect(),
        );
        record
    }

    #[test]
    fn test_empty_record_is_rejected() {
        let err = service()
            .submit(&owner("u-1"), SubmissionMethod::Manual, &SchoolRecord::new(), None)
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed { .. }));
    }

    #[test]
    fn test_second_commit_replaces_rows() {
        let service = service();
        let owner = owner("u-1");

        let id = service.submit(&owner, SubmissionMethod::Manual, &awards(3), None).unwrap();
        assert_eq!(service.section_row_count(&id, SectionKey::Awards).unwrap(), 3);

        let again = service.submit(&owner, SubmissionMethod::Manual, &awards(1), Some(&id)).unwrap();
        assert_eq!(again, id);
        assert_eq!(service.section_row_count(&id, SectionKey::Awards).unwrap(), 1);
        assert_eq!(service.list_records(&owner).unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_record_id_is_rejected() {
        let service = service();
        let id = service.submit(&owner("u-1"), SubmissionMethod::Manual, &awards(2), None).unwrap();

        let err = service
            .submit(&owner("u-2"), SubmissionMethod::Manual, &awards(5), Some(&id))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFoundOrUnauthorized { ref record_id } if *record_id == id));
        assert_eq!(service.section_row_count(&id, SectionKey::Awards).unwrap(), 2);

        let err = service
            .submit(&owner("u-1"), SubmissionMethod::Manual, &awards(1), Some("missing"))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFoundOrUnauthorized { .. }));
    }

    #[test]
    fn test_failed_section_rolls_back_whole_commit() {
        let service = service();
        let owner = owner("u-1");
        let id = service.submit(&owner, SubmissionMethod::Manual, &awards(2), None).unwrap();
        assert!(service.set_verified(&id, true).unwrap());

        service
            .db
            .lock()
            .execute_batch(
                "CREATE TRIGGER fail_volunteer BEFORE INSERT ON record_volunteer_activities
                 BEGIN SELECT RAISE(ABORT, 'volunteer insert failed'); END;",
            )
            .unwrap();

        let err = service
            .submit(
                &owner,
                SubmissionMethod::Manual,
                &with_volunteer_and_subjects(awards(4)),
                Some(&id),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::PersistenceFailure { .. }));
        assert!(err.is_retryable());

        // 父记录与前面的分区都保持原样
        assert_eq!(service.section_row_count(&id, SectionKey::Awards).unwrap(), 2);
        assert_eq!(service.section_row_count(&id, SectionKey::GeneralSubjects).unwrap(), 0);
        let (parent, _) = service.load_record(&owner, &id).unwrap();
        assert!(parent.is_verified);
        assert_eq!(parent.grade_level, GradeLevel::High1);

        // 新建记录失败时不留下父记录
        let err = service
            .submit(&owner, SubmissionMethod::Pdf, &with_volunteer_and_subjects(awards(1)), None)
            .unwrap_err();
        assert!(matches!(err, AppError::PersistenceFailure { .. }));
        assert_eq!(service.list_records(&owner).unwrap().len(), 1);
    }

    #[test]
    fn test_edit_resets_verification() {
        let service = service();
        let owner = owner("u-1");
        let id = service.submit(&owner, SubmissionMethod::Image, &awards(1), None).unwrap();
        service.set_verified(&id, true).unwrap();

        service
            .submit(&owner, SubmissionMethod::Manual, &with_volunteer_and_subjects(awards(1)), Some(&id))
            .unwrap();

        let (parent, _) = service.load_record(&owner, &id).unwrap();
        assert!(!parent.is_verified);
        assert_eq!(parent.submission_method, SubmissionMethod::Manual);
        assert_eq!(parent.grade_level, GradeLevel::High2);
        assert!(!service.set_verified("missing", true).unwrap());
    }

    #[test]
    fn test_reload_preserves_values_with_fresh_ids() {
        let service = service();
        let owner = owner("u-1");
        let record = with_volunteer_and_subjects(awards(3));
        let original_ids: HashSet<String> = record.rows().map(|(_, r)| r.id.clone()).collect();

        let id = service.submit(&owner, SubmissionMethod::Manual, &record, None).unwrap();
        let (parent, reloaded) = service.load_latest_for_edit(&owner).unwrap().unwrap();

        assert_eq!(parent.id, id);
        assert_eq!(parent.owner_id, "u-1");
        assert_eq!(reloaded.total_rows(), 5);

        let names: Vec<&serde_json::Value> = reloaded
            .section(SectionKey::Awards)
            .iter()
            .map(|r| &r.fields["name"])
            .collect();
        assert_eq!(names, vec![&json!("奖项 1"), &json!("奖项 2"), &json!("奖项 3")]);
        assert_eq!(
            reloaded.section(SectionKey::VolunteerActivities)[0].fields["hours"],
            json!(4.5)
        );
        assert_eq!(reloaded.section(SectionKey::GeneralSubjects)[0].fields["year"], json!(2));

        for (_, row) in reloaded.rows() {
            assert!(!row.id.is_empty());
            assert!(!original_ids.contains(&row.id));
        }
    }

    #[test]
    fn test_latest_record_is_owner_scoped() {
        let service = service();
        assert!(service.load_latest_for_edit(&owner("u-1")).unwrap().is_none());

        service.submit(&owner("u-2"), SubmissionMethod::Manual, &awards(1), None).unwrap();
        assert!(service.load_latest_for_edit(&owner("u-1")).unwrap().is_none());

        let first = service.submit(&owner("u-1"), SubmissionMethod::Manual, &awards(1), None).unwrap();
        let second = service.submit(&owner("u-1"), SubmissionMethod::Manual, &awards(2), None).unwrap();
        let (latest, _) = service.load_latest_for_edit(&owner("u-1")).unwrap().unwrap();
        assert_eq!(latest.id, second);

        let listed: Vec<String> = service
            .list_records(&owner("u-1"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(listed, vec![second, first]);
    }
}
