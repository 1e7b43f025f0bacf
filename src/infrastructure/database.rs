//! 数据库 - 基础设施层
//!
//! 持有唯一的 SQLite 连接，只暴露"加锁取连接"的能力。
//! 表结构由分区映射表生成：一张父表、11 张子表、一张草稿表。

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::models::grade::GradeLevel;
use crate::models::record::SubmissionMethod;
use crate::models::section::{FieldValue, SectionKey, ValueKind};

/// 数据库句柄
///
/// 连接放在互斥锁里：提交事务期间持有锁，其他读者看不到中间状态。
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// 打开（必要时创建）数据库文件
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self::init(conn)?)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 取得连接
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        // 持锁线程 panic 时事务已随 Transaction 的 drop 回滚，连接仍可用
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_records(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            submission_type TEXT NOT NULL CHECK(submission_type IN ('manual', 'pdf', 'image')),
            grade_level TEXT NOT NULL CHECK(grade_level IN ('high1', 'high2', 'high3')),
            is_verified INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_school_records_user ON school_records(user_id, updated_at)",
        [],
    )?;

    for section in SectionKey::ALL {
        conn.execute(&child_table_ddl(section), [])?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_record ON {table}(school_record_id, sort_order)",
                table = section.table()
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS record_drafts(
            user_id TEXT PRIMARY KEY,
            submission_type TEXT NOT NULL,
            record_json TEXT NOT NULL,
            reviewed INTEGER NOT NULL DEFAULT 0,
            edit_record_id TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    debug!("数据库表结构已就绪");
    Ok(())
}

/// 子表建表语句
pub fn child_table_ddl(section: SectionKey) -> String {
    let columns: Vec<String> = section
        .fields()
        .iter()
        .map(|f| {
            let not_null = if f.kind.is_nullable() { "" } else { " NOT NULL" };
            format!("{} {}{}", f.storage, f.kind.sql_type(), not_null)
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {table}(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            school_record_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            {columns},
            FOREIGN KEY(school_record_id) REFERENCES school_records(id) ON DELETE CASCADE
        )",
        table = section.table(),
        columns = columns.join(",\n            ")
    )
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            FieldValue::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            FieldValue::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            FieldValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

impl FromSql for SubmissionMethod {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

impl FromSql for GradeLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// 按声明类型读取列值
pub fn read_field(row: &rusqlite::Row<'_>, column: &str, kind: ValueKind) -> rusqlite::Result<FieldValue> {
    let value: SqlValue = row.get(column)?;
    Ok(match (value, kind) {
        (SqlValue::Null, _) => FieldValue::Null,
        (SqlValue::Integer(v), ValueKind::Real | ValueKind::OptionalReal) => FieldValue::Real(v as f64),
        (SqlValue::Integer(v), _) => FieldValue::Integer(v),
        (SqlValue::Real(v), ValueKind::Integer | ValueKind::OptionalInteger) => FieldValue::Integer(v as i64),
        (SqlValue::Real(v), _) => FieldValue::Real(v),
        (SqlValue::Text(v), _) => FieldValue::Text(v),
        (SqlValue::Blob(_), _) => FieldValue::Null,
    })
}
