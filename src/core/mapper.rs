use crate::config::FieldMapping;
use crate::core::formula;
use crate::core::transforms::{apply_chain, parse_chain, Transform};
use crate::domain::model::Record;
use crate::utils::error::{EtlError, Result};
use serde_json::{Map, Value};

enum ValueSource {
    Formula(String),
    Fixed(String),
    Column {
        name: String,
        transforms: Vec<Transform>,
    },
}

struct CompiledMapping {
    path: Vec<String>,
    source: ValueSource,
}

/// 將記錄依欄位對應轉換成巢狀 JSON payload
pub struct PayloadMapper {
    mappings: Vec<CompiledMapping>,
}

impl PayloadMapper {
    pub fn new(mappings: &[FieldMapping]) -> Self {
        let mappings = mappings
            .iter()
            .filter_map(|m| {
                let set = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

                // 優先序：formula > fixed_value > source_column
                let source = if let Some(formula) = set(&m.formula) {
                    ValueSource::Formula(formula)
                } else if let Some(fixed) = m.fixed_value.clone().filter(|v| !v.is_empty()) {
                    ValueSource::Fixed(fixed)
                } else if let Some(column) = set(&m.source_column) {
                    ValueSource::Column {
                        name: column,
                        transforms: parse_chain(&m.transform_chain()),
                    }
                } else {
                    tracing::warn!("⚠️ Mapping '{}' has no value source, skipped", m.attribute);
                    return None;
                };

                Some(CompiledMapping {
                    path: m.attribute.split('.').map(str::to_string).collect(),
                    source,
                })
            })
            .collect();

        Self { mappings }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// 依宣告順序處理每個對應；欄位不存在或轉換結果為空時略過該對應
    pub fn build(&self, record: &Record) -> Result<Value> {
        let mut payload = Map::new();

        for mapping in &self.mappings {
            let value = match &mapping.source {
                ValueSource::Formula(formula) => formula::evaluate(formula),
                ValueSource::Fixed(value) => Some(value.clone()),
                ValueSource::Column { name, transforms } => record
                    .get(name)
                    .and_then(|raw| apply_chain(raw, transforms)),
            };

            let Some(value) = value else {
                continue;
            };

            insert_path(&mut payload, &mapping.path, value)?;
        }

        Ok(Value::Object(payload))
    }
}

fn insert_path(root: &mut Map<String, Value>, path: &[String], value: String) -> Result<()> {
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(());
    };

    let mut current = root;
    for (depth, segment) in parents.iter().enumerate() {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(EtlError::PayloadError {
                    path: path[..=depth].join("."),
                })
            }
        };
    }

    if matches!(current.get(leaf), Some(Value::Object(_))) {
        return Err(EtlError::PayloadError {
            path: path.join("."),
        });
    }
    current.insert(leaf.clone(), Value::String(value));
    Ok(())
}
