use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::models::grade::GradeLevel;
use crate::models::section::{to_storage, SectionKey, StorageSections};

/// 生成新的客户端行 id
pub fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 分区中的一行
///
/// `id` 只用于客户端编辑，永远不是存储主键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl Row {
    /// 使用新 id 创建一行
    pub fn new(fields: BTreeMap<String, JsonValue>) -> Self {
        Self {
            id: new_row_id(),
            fields,
        }
    }

    /// 所有字段都为 null 或空白字符串
    pub fn is_blank(&self) -> bool {
        self.fields.values().all(|v| match v {
            JsonValue::Null => true,
            JsonValue::String(s) => s.trim().is_empty(),
            _ => false,
        })
    }
}

/// 提交方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionMethod {
    Manual,
    Pdf,
    Image,
}

impl SubmissionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionMethod::Manual => "manual",
            SubmissionMethod::Pdf => "pdf",
            SubmissionMethod::Image => "image",
        }
    }

    /// 是否需要上传文件并走提取服务
    pub fn is_file_based(self) -> bool {
        !matches!(self, SubmissionMethod::Manual)
    }
}

impl fmt::Display for SubmissionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(SubmissionMethod::Manual),
            "pdf" => Ok(SubmissionMethod::Pdf),
            "image" => Ok(SubmissionMethod::Image),
            other => Err(format!("未知提交方式: {}", other)),
        }
    }
}

/// 尚未持久化的学生档案：11 个分区，每个分区一个有序行列表
///
/// 序列化为以客户端分区键为键的 JSON 对象，且总是包含全部 11 个键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<SectionKey, Vec<Row>>",
    into = "BTreeMap<SectionKey, Vec<Row>>"
)]
pub struct SchoolRecord {
    sections: BTreeMap<SectionKey, Vec<Row>>,
}

impl From<BTreeMap<SectionKey, Vec<Row>>> for SchoolRecord {
    fn from(mut sections: BTreeMap<SectionKey, Vec<Row>>) -> Self {
        for key in SectionKey::ALL {
            sections.entry(key).or_default();
        }
        Self { sections }
    }
}

impl From<SchoolRecord> for BTreeMap<SectionKey, Vec<Row>> {
    fn from(record: SchoolRecord) -> Self {
        record.sections
    }
}

impl Default for SchoolRecord {
    fn default() -> Self {
        Self::from(BTreeMap::new())
    }
}

impl SchoolRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self, key: SectionKey) -> &[Row] {
        self.sections.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn section_mut(&mut self, key: SectionKey) -> &mut Vec<Row> {
        self.sections.entry(key).or_default()
    }

    /// 按分区顺序遍历所有行
    pub fn rows(&self) -> impl Iterator<Item = (SectionKey, &Row)> {
        self.sections
            .iter()
            .flat_map(|(key, rows)| rows.iter().map(move |row| (*key, row)))
    }

    pub fn total_rows(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }

    /// 至少有一行非空
    pub fn has_content(&self) -> bool {
        self.rows().any(|(_, row)| !row.is_blank())
    }

    /// 追加一行并返回其 id
    pub fn add_row(&mut self, key: SectionKey, fields: BTreeMap<String, JsonValue>) -> String {
        let row = Row::new(fields);
        let id = row.id.clone();
        self.section_mut(key).push(row);
        id
    }

    /// 更新某行的单个字段，找不到行时返回 false
    pub fn update_field(
        &mut self,
        key: SectionKey,
        row_id: &str,
        field: &str,
        value: JsonValue,
    ) -> bool {
        match self.section_mut(key).iter_mut().find(|r| r.id == row_id) {
            Some(row) => {
                row.fields.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// 删除某行，找不到时返回 false
    pub fn remove_row(&mut self, key: SectionKey, row_id: &str) -> bool {
        let rows = self.section_mut(key);
        let before = rows.len();
        rows.retain(|r| r.id != row_id);
        rows.len() != before
    }

    /// 为每一行分配新的唯一 id
    pub fn assign_fresh_ids(&mut self) {
        for rows in self.sections.values_mut() {
            for row in rows.iter_mut() {
                row.id = new_row_id();
            }
        }
    }

    /// 从外部 JSON 解析
    ///
    /// 顶层必须是对象；已知分区的值必须是对象数组，缺失分区视为空。
    /// 未知分区键直接丢弃。行 id 一律重新分配。
    pub fn from_json_sections(value: &JsonValue) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "顶层不是 JSON 对象".to_string())?;

        let mut record = SchoolRecord::new();
        for (key, section_value) in obj {
            let Ok(section) = key.parse::<SectionKey>() else {
                tracing::debug!("丢弃未知分区: {}", key);
                continue;
            };
            let items = match section_value {
                JsonValue::Array(items) => items,
                JsonValue::Null => continue,
                _ => return Err(format!("分区 {} 不是数组", key)),
            };
            let rows = record.section_mut(section);
            for (idx, item) in items.iter().enumerate() {
                let fields = item
                    .as_object()
                    .ok_or_else(|| format!("分区 {} 第 {} 行不是对象", key, idx + 1))?
                    .iter()
                    .filter(|(name, _)| name.as_str() != "id")
                    .map(|(name, v)| (name.clone(), v.clone()))
                    .collect();
                rows.push(Row::new(fields));
            }
        }
        Ok(record)
    }

    /// 转换为 11 个分区的存储形态
    pub fn to_storage_sections(&self) -> StorageSections {
        SectionKey::ALL
            .into_iter()
            .map(|key| {
                let rows = self.section(key).iter().map(|r| to_storage(r, key)).collect();
                (key, rows)
            })
            .collect()
    }
}

/// 已认证的所有者
///
/// 只能通过 `Owner::authenticate` 构造，草稿和提交接口不接受客户端传入的 owner id。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    /// 从会话中取出的用户 id 构造；缺失或为空时返回 `AuthenticationRequired`
    pub fn authenticate(session_user: Option<&str>) -> crate::error::AppResult<Self> {
        match session_user.map(str::trim) {
            Some(id) if !id.is_empty() => Ok(Self(id.to_string())),
            _ => Err(crate::error::AppError::AuthenticationRequired),
        }
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 已提交的档案
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedRecord {
    pub id: String,
    pub owner_id: String,
    pub submission_method: SubmissionMethod,
    pub grade_level: GradeLevel,
    pub is_verified: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// 每个所有者唯一的草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub submission_method: SubmissionMethod,
    pub record: SchoolRecord,
    pub reviewed: bool,
    /// 编辑会话中保存的草稿指向被编辑的记录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_record_id: Option<String>,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_always_serializes_all_sections() {
        let record = SchoolRecord::new();
        let value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 11);
        assert!(obj.contains_key("generalSubjects"));
        assert!(obj.contains_key("behavioralEvaluations"));
    }

    #[test]
    fn test_partial_json_fills_missing_sections() {
        let record: SchoolRecord = serde_json::from_value(json!({
            "awards": [{ "id": "r1", "name": "科学展览", "year": 1 }]
        }))
        .unwrap();
        assert_eq!(record.section(SectionKey::Awards).len(), 1);
        assert_eq!(record.section(SectionKey::Attendance).len(), 0);
        assert_eq!(serde_json::to_value(&record).unwrap().as_object().unwrap().len(), 11);
    }

    #[test]
    fn test_row_id_is_flattened_next_to_fields() {
        let row: Row = serde_json::from_value(json!({ "id": "abc", "subject": "国语" })).unwrap();
        assert_eq!(row.id, "abc");
        assert_eq!(row.fields.get("subject"), Some(&json!("国语")));
        assert!(!row.fields.contains_key("id"));
    }

    #[test]
    fn test_has_content_ignores_blank_rows() {
        let mut record = SchoolRecord::new();
        record.add_row(
            SectionKey::Awards,
            BTreeMap::from([("name".to_string(), json!("  ")), ("year".to_string(), json!(null))]),
        );
        assert!(!record.has_content());

        let id = record.section(SectionKey::Awards)[0].id.clone();
        assert!(record.update_field(SectionKey::Awards, &id, "name", json!("演讲比赛")));
        assert!(record.has_content());
    }

    #[test]
    fn test_remove_row_by_id() {
        let mut record = SchoolRecord::new();
        let keep = record.add_row(SectionKey::Certifications, BTreeMap::new());
        let drop = record.add_row(SectionKey::Certifications, BTreeMap::new());
        assert!(record.remove_row(SectionKey::Certifications, &drop));
        assert!(!record.remove_row(SectionKey::Certifications, &drop));
        assert_eq!(record.section(SectionKey::Certifications)[0].id, keep);
    }

    #[test]
    fn test_from_json_sections_validates_shape() {
        let record = SchoolRecord::from_json_sections(&json!({
            "generalSubjects": [{ "subject": "英语", "year": 1, "id": "llm-made-up" }],
            "awards": null,
            "unknownSection": [1, 2]
        }))
        .unwrap();
        let rows = record.section(SectionKey::GeneralSubjects);
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].id, "llm-made-up");
        assert!(!rows[0].fields.contains_key("id"));

        assert!(SchoolRecord::from_json_sections(&json!([1, 2])).is_err());
        assert!(SchoolRecord::from_json_sections(&json!({ "awards": "none" })).is_err());
        assert!(SchoolRecord::from_json_sections(&json!({ "awards": [3] })).is_err());
    }

    #[test]
    fn test_authenticate_requires_owner() {
        assert!(Owner::authenticate(None).is_err());
        assert!(Owner::authenticate(Some("  ")).is_err());
        assert_eq!(Owner::authenticate(Some("user-1")).unwrap().id(), "user-1");
    }
}
