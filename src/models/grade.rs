use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use crate::models::record::SchoolRecord;

/// 年级（由档案内容推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeLevel {
    High1,
    High2,
    High3,
}

impl GradeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeLevel::High1 => "high1",
            GradeLevel::High2 => "high2",
            GradeLevel::High3 => "high3",
        }
    }

    /// 根据最大学年映射：>=3 为高三，2 为高二，其余为高一
    pub fn from_year(year: i64) -> Self {
        match year {
            y if y >= 3 => GradeLevel::High3,
            2 => GradeLevel::High2,
            _ => GradeLevel::High1,
        }
    }
}

impl fmt::Display for GradeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GradeLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high1" => Ok(GradeLevel::High1),
            "high2" => Ok(GradeLevel::High2),
            "high3" => Ok(GradeLevel::High3),
            other => Err(format!("未知年级: {}", other)),
        }
    }
}

/// 推导年级
///
/// 扫描所有分区所有行的 `year` 字段取最大值；缺失或非数字视为不存在，
/// 没有任何行提供学年时按 1 处理。
pub fn derive_grade_level(record: &SchoolRecord) -> GradeLevel {
    let max_year = record
        .rows()
        .filter_map(|(_, row)| row.fields.get("year").and_then(numeric_year))
        .max()
        .unwrap_or(1);

    GradeLevel::from_year(max_year)
}

fn numeric_year(value: &JsonValue) -> Option<i64> {
    let f = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then(|| f.floor() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::section::SectionKey;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn with_year(year: JsonValue) -> BTreeMap<String, JsonValue> {
        BTreeMap::from([("year".to_string(), year)])
    }

    #[test]
    fn test_empty_record_is_high1() {
        assert_eq!(derive_grade_level(&SchoolRecord::new()), GradeLevel::High1);
    }

    #[test]
    fn test_single_year3_row_anywhere_is_high3() {
        let mut record = SchoolRecord::new();
        record.add_row(SectionKey::GeneralSubjects, with_year(json!(1)));
        record.add_row(SectionKey::GeneralSubjects, with_year(json!(2)));
        record.add_row(SectionKey::BehavioralEvaluations, with_year(json!(3)));
        assert_eq!(derive_grade_level(&record), GradeLevel::High3);
    }

    #[test]
    fn test_non_numeric_years_are_ignored() {
        let mut record = SchoolRecord::new();
        record.add_row(SectionKey::Awards, with_year(json!("三年级")));
        record.add_row(SectionKey::Awards, with_year(json!(null)));
        record.add_row(SectionKey::Attendance, with_year(json!("2")));
        assert_eq!(derive_grade_level(&record), GradeLevel::High2);
    }

    #[test]
    fn test_invariant_under_reordering() {
        let years = [json!(2), json!(1), json!("3"), json!(null)];
        let sections = [
            SectionKey::Attendance,
            SectionKey::Awards,
            SectionKey::VolunteerActivities,
            SectionKey::CareerSubjects,
        ];

        let mut forward = SchoolRecord::new();
        for (section, year) in sections.iter().zip(years.iter()) {
            forward.add_row(*section, with_year(year.clone()));
        }

        let mut reversed = SchoolRecord::new();
        for (section, year) in sections.iter().rev().zip(years.iter()) {
            reversed.add_row(*section, with_year(year.clone()));
        }

        assert_eq!(derive_grade_level(&forward), derive_grade_level(&reversed));
        assert_eq!(derive_grade_level(&forward), GradeLevel::High3);
    }

    #[test]
    fn test_from_year_mapping() {
        assert_eq!(GradeLevel::from_year(0), GradeLevel::High1);
        assert_eq!(GradeLevel::from_year(1), GradeLevel::High1);
        assert_eq!(GradeLevel::from_year(2), GradeLevel::High2);
        assert_eq!(GradeLevel::from_year(4), GradeLevel::High3);
    }
}
