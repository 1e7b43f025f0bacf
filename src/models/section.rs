//! 学生档案的 11 个固定分区及字段映射
//!
//! 每个分区声明一张 (客户端字段名, 存储列名, 值类型) 映射表。
//! `to_storage` / `to_client` 只依据这些表做重命名与类型归一化，
//! 没有逐字段的手写转换代码。

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::models::record::{new_row_id, Row};

/// 分区键
///
/// 声明顺序即序列化顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionKey {
    /// 出缺勤
    Attendance,
    /// 获奖
    Awards,
    /// 资格证书
    Certifications,
    /// 升学志向
    CareerAspirations,
    /// 创意体验活动
    CreativeActivities,
    /// 志愿服务
    VolunteerActivities,
    /// 普通科目成绩
    GeneralSubjects,
    /// 职业选修科目成绩
    CareerSubjects,
    /// 艺体科目成绩
    ArtsPhysicalSubjects,
    /// 科目教师评语
    SubjectEvaluations,
    /// 行为特征及综合意见
    BehavioralEvaluations,
}

/// 字段值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Real,
    Text,
    OptionalInteger,
    OptionalReal,
    OptionalText,
}

impl ValueKind {
    pub fn is_nullable(self) -> bool {
        matches!(
            self,
            ValueKind::OptionalInteger | ValueKind::OptionalReal | ValueKind::OptionalText
        )
    }

    /// SQLite 列类型
    pub fn sql_type(self) -> &'static str {
        match self {
            ValueKind::Integer | ValueKind::OptionalInteger => "INTEGER",
            ValueKind::Real | ValueKind::OptionalReal => "REAL",
            ValueKind::Text | ValueKind::OptionalText => "TEXT",
        }
    }

    /// 提取提示词里使用的类型说明
    pub fn prompt_type(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Real => "number",
            ValueKind::Text => "string",
            ValueKind::OptionalInteger => "integer|null",
            ValueKind::OptionalReal => "number|null",
            ValueKind::OptionalText => "string|null",
        }
    }

    fn zero(self) -> FieldValue {
        match self {
            ValueKind::Integer => FieldValue::Integer(0),
            ValueKind::Real => FieldValue::Real(0.0),
            ValueKind::Text => FieldValue::Text(String::new()),
            _ => FieldValue::Null,
        }
    }

    /// 把客户端值归一化为该类型，无法识别时返回零值或 NULL
    pub fn coerce(self, value: &JsonValue) -> FieldValue {
        let coerced = match self {
            ValueKind::Integer | ValueKind::OptionalInteger => coerce_integer(value),
            ValueKind::Real | ValueKind::OptionalReal => coerce_real(value),
            ValueKind::Text | ValueKind::OptionalText => coerce_text(value),
        };
        coerced.unwrap_or_else(|| self.zero())
    }
}

/// 单个字段映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub client: &'static str,
    pub storage: &'static str,
    pub kind: ValueKind,
}

const fn field(client: &'static str, storage: &'static str, kind: ValueKind) -> FieldSpec {
    FieldSpec {
        client,
        storage,
        kind,
    }
}

use ValueKind::{Integer, OptionalInteger, OptionalReal, OptionalText, Text};

const ATTENDANCE_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("totalDays", "school_days", OptionalInteger),
    field("illnessAbsence", "absence_illness", Integer),
    field("unexcusedAbsence", "absence_unexcused", Integer),
    field("otherAbsence", "absence_other", Integer),
    field("illnessLateness", "lateness_illness", Integer),
    field("unexcusedLateness", "lateness_unexcused", Integer),
    field("otherLateness", "lateness_other", Integer),
    field("illnessEarlyLeave", "early_leave_illness", Integer),
    field("unexcusedEarlyLeave", "early_leave_unexcused", Integer),
    field("otherEarlyLeave", "early_leave_other", Integer),
    field("illnessClassMissed", "class_missed_illness", Integer),
    field("unexcusedClassMissed", "class_missed_unexcused", Integer),
    field("otherClassMissed", "class_missed_other", Integer),
    field("note", "remarks", OptionalText),
];

const AWARD_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("semester", "semester", OptionalInteger),
    field("name", "award_name", Text),
    field("rank", "award_rank", OptionalText),
    field("date", "awarded_on", OptionalText),
    field("organization", "awarding_body", OptionalText),
    field("participants", "participants", OptionalText),
];

const CERTIFICATION_FIELDS: &[FieldSpec] = &[
    field("name", "certificate_name", Text),
    field("details", "certificate_number", OptionalText),
    field("date", "acquired_on", OptionalText),
    field("issuer", "issuing_body", OptionalText),
];

const CAREER_ASPIRATION_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("studentHope", "student_aspiration", OptionalText),
    field("parentHope", "parent_aspiration", OptionalText),
    field("reason", "reason", OptionalText),
];

const CREATIVE_ACTIVITY_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("area", "activity_area", Text),
    field("hours", "hours", OptionalReal),
    field("note", "special_notes", OptionalText),
];

const VOLUNTEER_ACTIVITY_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("date", "period", OptionalText),
    field("place", "organization", OptionalText),
    field("content", "activity_content", OptionalText),
    field("hours", "hours", OptionalReal),
    field("cumulativeHours", "cumulative_hours", OptionalReal),
];

const GENERAL_SUBJECT_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("semester", "semester", OptionalInteger),
    field("category", "curriculum_area", OptionalText),
    field("subject", "subject_name", Text),
    field("credits", "credits", OptionalInteger),
    field("rawScore", "raw_score", OptionalReal),
    field("subjectAverage", "subject_average", OptionalReal),
    field("standardDeviation", "standard_deviation", OptionalReal),
    field("achievement", "achievement_level", OptionalText),
    field("studentCount", "student_count", OptionalInteger),
    field("rank", "grade_rank", OptionalInteger),
];

const CAREER_SUBJECT_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("semester", "semester", OptionalInteger),
    field("category", "curriculum_area", OptionalText),
    field("subject", "subject_name", Text),
    field("credits", "credits", OptionalInteger),
    field("rawScore", "raw_score", OptionalReal),
    field("subjectAverage", "subject_average", OptionalReal),
    field("achievement", "achievement_level", OptionalText),
    field("studentCount", "student_count", OptionalInteger),
    field("achievementDistribution", "achievement_distribution", OptionalText),
];

const ARTS_PHYSICAL_SUBJECT_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("semester", "semester", OptionalInteger),
    field("category", "curriculum_area", OptionalText),
    field("subject", "subject_name", Text),
    field("credits", "credits", OptionalInteger),
    field("achievement", "achievement_level", OptionalText),
];

const SUBJECT_EVALUATION_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("semester", "semester", OptionalInteger),
    field("subject", "subject_name", Text),
    field("evaluation", "evaluation_text", Text),
];

const BEHAVIORAL_EVALUATION_FIELDS: &[FieldSpec] = &[
    field("year", "year", OptionalInteger),
    field("evaluation", "opinion_text", Text),
];

impl SectionKey {
    /// 全部 11 个分区
    pub const ALL: [SectionKey; 11] = [
        SectionKey::Attendance,
        SectionKey::Awards,
        SectionKey::Certifications,
        SectionKey::CareerAspirations,
        SectionKey::CreativeActivities,
        SectionKey::VolunteerActivities,
        SectionKey::GeneralSubjects,
        SectionKey::CareerSubjects,
        SectionKey::ArtsPhysicalSubjects,
        SectionKey::SubjectEvaluations,
        SectionKey::BehavioralEvaluations,
    ];

    /// 客户端使用的分区键
    pub fn client_key(self) -> &'static str {
        match self {
            SectionKey::Attendance => "attendance",
            SectionKey::Awards => "awards",
            SectionKey::Certifications => "certifications",
            SectionKey::CareerAspirations => "careerAspirations",
            SectionKey::CreativeActivities => "creativeActivities",
            SectionKey::VolunteerActivities => "volunteerActivities",
            SectionKey::GeneralSubjects => "generalSubjects",
            SectionKey::CareerSubjects => "careerSubjects",
            SectionKey::ArtsPhysicalSubjects => "artsPhysicalSubjects",
            SectionKey::SubjectEvaluations => "subjectEvaluations",
            SectionKey::BehavioralEvaluations => "behavioralEvaluations",
        }
    }

    /// 存储子表名
    pub fn table(self) -> &'static str {
        match self {
            SectionKey::Attendance => "record_attendance",
            SectionKey::Awards => "record_awards",
            SectionKey::Certifications => "record_certifications",
            SectionKey::CareerAspirations => "record_career_aspirations",
            SectionKey::CreativeActivities => "record_creative_activities",
            SectionKey::VolunteerActivities => "record_volunteer_activities",
            SectionKey::GeneralSubjects => "record_general_subjects",
            SectionKey::CareerSubjects => "record_career_subjects",
            SectionKey::ArtsPhysicalSubjects => "record_arts_physical_subjects",
            SectionKey::SubjectEvaluations => "record_subject_evaluations",
            SectionKey::BehavioralEvaluations => "record_behavioral_evaluations",
        }
    }

    /// 中文名称，用于日志和提示词
    pub fn label(self) -> &'static str {
        match self {
            SectionKey::Attendance => "出缺勤",
            SectionKey::Awards => "获奖",
            SectionKey::Certifications => "资格证书",
            SectionKey::CareerAspirations => "升学志向",
            SectionKey::CreativeActivities => "创意体验活动",
            SectionKey::VolunteerActivities => "志愿服务",
            SectionKey::GeneralSubjects => "普通科目成绩",
            SectionKey::CareerSubjects => "职业选修科目成绩",
            SectionKey::ArtsPhysicalSubjects => "艺体科目成绩",
            SectionKey::SubjectEvaluations => "科目教师评语",
            SectionKey::BehavioralEvaluations => "行为特征及综合意见",
        }
    }

    /// 字段映射表
    pub fn fields(self) -> &'static [FieldSpec] {
        match self {
            SectionKey::Attendance => ATTENDANCE_FIELDS,
            SectionKey::Awards => AWARD_FIELDS,
            SectionKey::Certifications => CERTIFICATION_FIELDS,
            SectionKey::CareerAspirations => CAREER_ASPIRATION_FIELDS,
            SectionKey::CreativeActivities => CREATIVE_ACTIVITY_FIELDS,
            SectionKey::VolunteerActivities => VOLUNTEER_ACTIVITY_FIELDS,
            SectionKey::GeneralSubjects => GENERAL_SUBJECT_FIELDS,
            SectionKey::CareerSubjects => CAREER_SUBJECT_FIELDS,
            SectionKey::ArtsPhysicalSubjects => ARTS_PHYSICAL_SUBJECT_FIELDS,
            SectionKey::SubjectEvaluations => SUBJECT_EVALUATION_FIELDS,
            SectionKey::BehavioralEvaluations => BEHAVIORAL_EVALUATION_FIELDS,
        }
    }

    pub fn field(self, client: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.client == client)
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.client_key())
    }
}

impl FromStr for SectionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectionKey::ALL
            .into_iter()
            .find(|k| k.client_key() == s)
            .ok_or_else(|| format!("未知分区: {}", s))
    }
}

// ========== 存储形态 ==========

/// f64 能精确表示的整数上界（2^53）
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// 存储列的值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Integer(v) => JsonValue::from(*v),
            // 整数值的 REAL 列按整数输出，与录入时的 JSON 保持一致
            FieldValue::Real(v) if v.fract() == 0.0 && v.abs() < MAX_EXACT_INTEGER => {
                JsonValue::from(*v as i64)
            }
            FieldValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Text(v) => JsonValue::String(v.clone()),
        }
    }
}

/// 存储形态的一行：按存储列名索引，不含客户端 id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageRow {
    pub values: BTreeMap<&'static str, FieldValue>,
}

impl StorageRow {
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }
}

/// 11 个分区的存储形态
pub type StorageSections = BTreeMap<SectionKey, Vec<StorageRow>>;

/// 客户端行 → 存储行
///
/// 去掉客户端 id，按映射表重命名并归一化类型。
/// 未声明的字段直接丢弃（只记 debug 日志）。
pub fn to_storage(row: &Row, section: SectionKey) -> StorageRow {
    let specs = section.fields();

    for name in row.fields.keys() {
        if !specs.iter().any(|f| f.client == name) {
            debug!("分区 {} 丢弃未声明字段: {}", section, name);
        }
    }

    let values = specs
        .iter()
        .map(|spec| {
            let value = row
                .fields
                .get(spec.client)
                .map(|v| spec.kind.coerce(v))
                .unwrap_or_else(|| spec.kind.zero());
            (spec.storage, value)
        })
        .collect();

    StorageRow { values }
}

/// 存储行 → 客户端行，并分配新的客户端 id
pub fn to_client(row: &StorageRow, section: SectionKey) -> Row {
    let fields = section
        .fields()
        .iter()
        .map(|spec| {
            let value = row
                .values
                .get(spec.storage)
                .map(FieldValue::to_json)
                .unwrap_or(JsonValue::Null);
            (spec.client.to_string(), value)
        })
        .collect();

    Row {
        id: new_row_id(),
        fields,
    }
}

// ========== 类型归一化 ==========

fn coerce_integer(value: &JsonValue) -> Option<FieldValue> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(FieldValue::Integer),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .map(FieldValue::Integer)
        }
        _ => None,
    }
}

fn coerce_real(value: &JsonValue) -> Option<FieldValue> {
    match value {
        JsonValue::Number(n) => n.as_f64().map(FieldValue::Real),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Real),
        _ => None,
    }
}

fn coerce_text(value: &JsonValue) -> Option<FieldValue> {
    match value {
        JsonValue::String(s) => Some(FieldValue::Text(s.clone())),
        JsonValue::Number(n) => Some(FieldValue::Text(n.to_string())),
        JsonValue::Bool(b) => Some(FieldValue::Text(b.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn row(fields: JsonValue) -> Row {
        serde_json::from_value(fields).unwrap()
    }

    #[test]
    fn test_every_section_mapping_is_bijective() {
        for section in SectionKey::ALL {
            let specs = section.fields();
            let clients: HashSet<_> = specs.iter().map(|f| f.client).collect();
            let columns: HashSet<_> = specs.iter().map(|f| f.storage).collect();
            assert_eq!(clients.len(), specs.len(), "{} 客户端字段重复", section);
            assert_eq!(columns.len(), specs.len(), "{} 存储列重复", section);
            assert!(!clients.contains("id"), "{} 不能声明 id 字段", section);
        }
    }

    #[test]
    fn test_section_key_parses_client_key() {
        for section in SectionKey::ALL {
            assert_eq!(section.client_key().parse::<SectionKey>().unwrap(), section);
        }
        assert!("grades".parse::<SectionKey>().is_err());
    }

    #[test]
    fn test_round_trip_preserves_declared_fields() {
        let original = row(json!({
            "id": "client-1",
            "year": 2,
            "semester": 1,
            "category": "数学",
            "subject": "数学 I",
            "credits": 4,
            "rawScore": 91.5,
            "subjectAverage": 70.25,
            "standardDeviation": 12.5,
            "achievement": "A",
            "studentCount": 210,
            "rank": 2
        }));

        let storage = to_storage(&original, SectionKey::GeneralSubjects);
        assert!(storage.get("id").is_none());
        assert_eq!(storage.get("subject_name"), Some(&FieldValue::Text("数学 I".into())));

        let back = to_client(&storage, SectionKey::GeneralSubjects);
        assert_ne!(back.id, original.id);
        assert!(!back.id.is_empty());
        assert_eq!(back.fields, original.fields);
    }

    #[test]
    fn test_integral_scores_come_back_as_integers() {
        let original = row(json!({
            "id": "a",
            "subject": "国语",
            "rawScore": 91,
            "subjectAverage": 72.5,
            "standardDeviation": -0.0
        }));
        let back = to_client(
            &to_storage(&original, SectionKey::GeneralSubjects),
            SectionKey::GeneralSubjects,
        );
        assert_eq!(back.fields["rawScore"], json!(91));
        assert_eq!(back.fields["subjectAverage"], json!(72.5));
        assert_eq!(back.fields["standardDeviation"], json!(0));
        assert_eq!(FieldValue::Real(1e300).to_json(), json!(1e300));
    }

    #[test]
    fn test_round_trip_all_sections_with_nulls() {
        for section in SectionKey::ALL {
            let fields: BTreeMap<String, JsonValue> = section
                .fields()
                .iter()
                .map(|f| {
                    let v = match f.kind {
                        ValueKind::Integer => json!(3),
                        ValueKind::Real => json!(1.5),
                        ValueKind::Text => json!("内容"),
                        _ => JsonValue::Null,
                    };
                    (f.client.to_string(), v)
                })
                .collect();
            let original = Row {
                id: "x".into(),
                fields,
            };
            let back = to_client(&to_storage(&original, section), section);
            assert_eq!(back.fields, original.fields, "{} 往返不一致", section);
        }
    }

    #[test]
    fn test_unknown_fields_are_dropped() {
        let original = row(json!({
            "id": "a",
            "name": "数学竞赛",
            "confidence": 0.93
        }));
        let storage = to_storage(&original, SectionKey::Awards);
        assert_eq!(storage.values.len(), SectionKey::Awards.fields().len());

        let back = to_client(&storage, SectionKey::Awards);
        assert!(!back.fields.contains_key("confidence"));
    }

    #[test]
    fn test_missing_fields_use_kind_defaults() {
        let storage = to_storage(&row(json!({ "id": "a" })), SectionKey::Attendance);
        assert_eq!(storage.get("year"), Some(&FieldValue::Null));
        assert_eq!(storage.get("absence_illness"), Some(&FieldValue::Integer(0)));
        assert_eq!(storage.get("remarks"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_coercion_accepts_numeric_strings() {
        assert_eq!(ValueKind::OptionalInteger.coerce(&json!("3")), FieldValue::Integer(3));
        assert_eq!(ValueKind::OptionalInteger.coerce(&json!(2.0)), FieldValue::Integer(2));
        assert_eq!(ValueKind::OptionalInteger.coerce(&json!("二")), FieldValue::Null);
        assert_eq!(ValueKind::OptionalReal.coerce(&json!(" 4.5 ")), FieldValue::Real(4.5));
        assert_eq!(ValueKind::Text.coerce(&json!(12)), FieldValue::Text("12".into()));
        assert_eq!(ValueKind::Integer.coerce(&json!(null)), FieldValue::Integer(0));
    }
}
