use crate::config::{ColumnSpec, FilterOperator};
use crate::domain::model::Record;

/// 已攤平的過濾規則，帶有欄位名稱
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
    pub case_insensitive: bool,
}

impl FilterRule {
    /// 欄位不存在時規則不成立，記錄被排除
    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.get(&self.column) else {
            return false;
        };

        let (actual, expected) = if self.case_insensitive {
            (actual.to_lowercase(), self.value.to_lowercase())
        } else {
            (actual.to_string(), self.value.clone())
        };

        match self.operator {
            FilterOperator::Equals => actual == expected,
            FilterOperator::NotEquals => actual != expected,
            FilterOperator::Contains => actual.contains(&expected),
            FilterOperator::NotContains => !actual.contains(&expected),
        }
    }
}

/// 所有規則以 AND 組合，遇到第一個不成立的規則即排除
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    rules: Vec<FilterRule>,
}

impl RecordFilter {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    pub fn from_columns(columns: &[ColumnSpec]) -> Self {
        let rules = columns
            .iter()
            .flat_map(|spec| {
                spec.filters.iter().map(move |f| FilterRule {
                    column: spec.column.clone(),
                    operator: f.operator,
                    value: f.value.clone(),
                    case_insensitive: f.case_insensitive,
                })
            })
            .collect();
        Self { rules }
    }

    pub fn passes_filters(&self, record: &Record) -> bool {
        self.rules.iter().all(|rule| rule.matches(record))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.rules.is_empty() {
            return "no filters configured".to_string();
        }

        let rules: Vec<String> = self
            .rules
            .iter()
            .map(|r| {
                format!(
                    "{} {:?} '{}'{}",
                    r.column,
                    r.operator,
                    r.value,
                    if r.case_insensitive { " (case-insensitive)" } else { "" }
                )
            })
            .collect();
        format!("{} filter(s): {}", self.rules.len(), rules.join(", "))
    }
}
