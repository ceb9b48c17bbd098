use crate::config::RunOverrides;
use crate::core::transforms::Transform;
use crate::domain::model::ExecutionPaths;
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub file: FileConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub input_path: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_batch_lines")]
    pub batch_lines: usize,
    #[serde(default = "default_start_line")]
    pub start_line: u64,
    pub max_lines: Option<u64>,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    pub checkpoint_path: Option<String>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_seconds: u64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_seconds: u64,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

/// 單一欄位的驗證與過濾規則
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column: String,
    #[serde(rename = "type", default)]
    pub column_type: ColumnType,
    pub regex: Option<String>,
    pub format: Option<String>,
    #[serde(default)]
    pub filters: Vec<ColumnFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    String,
    Date,
    Integer,
    Decimal,
    Boolean,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = "Equals")]
    Equals,
    #[serde(alias = "NotEquals")]
    NotEquals,
    #[serde(alias = "Contains")]
    Contains,
    #[serde(alias = "NotContains")]
    NotContains,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// 以記錄中的欄位值選擇端點
    pub endpoint_column: Option<String>,
    pub default_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub max_requests_per_second: Option<u32>,
    #[serde(default)]
    pub mapping: Vec<FieldMapping>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "post", alias = "Post")]
    Post,
    #[serde(alias = "put", alias = "Put")]
    Put,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// 欄位到 API 屬性的映射
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMapping {
    /// 目標屬性，`.` 代表巢狀物件
    pub attribute: String,
    pub source_column: Option<String>,
    pub fixed_value: Option<String>,
    pub formula: Option<String>,
    #[serde(default)]
    pub transforms: Vec<String>,
    /// 舊格式的單一轉換，`transforms` 為空時才使用
    pub transform: Option<String>,
}

impl FieldMapping {
    /// 實際要套用的轉換鏈
    pub fn transform_chain(&self) -> Vec<String> {
        if !self.transforms.is_empty() {
            return self.transforms.clone();
        }
        self.transform.iter().cloned().collect()
    }

    fn validate_sources(&self, field: &str) -> Result<()> {
        validation::validate_non_empty_string(&format!("{}.attribute", field), &self.attribute)?;

        let is_set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        let sources = [
            is_set(&self.source_column),
            self.fixed_value.as_deref().is_some_and(|s| !s.is_empty()),
            is_set(&self.formula),
        ];
        let count = sources.iter().filter(|s| **s).count();

        if count == 0 {
            return Err(EtlError::ConfigValidationError {
                field: field.to_string(),
                message: format!(
                    "mapping for '{}' needs one of source_column, fixed_value or formula",
                    self.attribute
                ),
            });
        }
        if count > 1 {
            return Err(EtlError::ConfigValidationError {
                field: field.to_string(),
                message: format!(
                    "mapping for '{}' must set only one of source_column, fixed_value or formula",
                    self.attribute
                ),
            });
        }

        if self.attribute.split('.').any(|segment| segment.is_empty()) {
            return Err(EtlError::InvalidConfigValueError {
                field: format!("{}.attribute", field),
                value: self.attribute.clone(),
                reason: "Attribute path has an empty segment".to_string(),
            });
        }

        let chain = self.transform_chain();
        if !chain.is_empty() && !is_set(&self.source_column) {
            tracing::warn!(
                "⚠️ Transforms on '{}' are ignored because the value does not come from a column",
                self.attribute
            );
        }
        for name in &chain {
            if matches!(Transform::parse(name), Transform::Unknown(_)) {
                tracing::warn!(
                    "⚠️ Unknown transform '{}' on '{}' will leave the value unchanged",
                    name,
                    self.attribute
                );
            }
        }

        Ok(())
    }
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_batch_lines() -> usize {
    100
}

fn default_start_line() -> u64 {
    1
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_string()
}

fn default_checkpoint_interval() -> u64 {
    30
}

fn default_progress_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl AppConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${API_TOKEN})，找不到的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| EtlError::config(e.to_string()))?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 套用命令列覆蓋設定
    pub fn apply_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(input) = &overrides.input_path {
            self.file.input_path = input.clone();
        }
        if let Some(batch_lines) = overrides.batch_lines {
            self.file.batch_lines = batch_lines;
        }
        if let Some(delimiter) = &overrides.delimiter {
            self.file.delimiter = delimiter.clone();
        }
        if let Some(start_line) = overrides.start_line {
            self.file.start_line = start_line;
        }
        if let Some(max_lines) = overrides.max_lines {
            self.file.max_lines = Some(max_lines);
        }
        if let Some(log_dir) = &overrides.log_dir {
            self.file.log_dir = log_dir.clone();
        }
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        validation::parse_delimiter("file.delimiter", &self.file.delimiter)
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// 依執行 ID 產生檢查點與錯誤日誌路徑
    pub fn execution_paths(&self, execution_id: &str) -> ExecutionPaths {
        let checkpoint_path = match &self.file.checkpoint_path {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.file.checkpoint_dir)
                .join(format!("checkpoint_{}.json", execution_id)),
        };

        ExecutionPaths {
            execution_id: execution_id.to_string(),
            checkpoint_path,
            log_path: Path::new(&self.file.log_dir).join(format!("process_{}.csv", execution_id)),
        }
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validation::validate_existing_file("file.input_path", &self.file.input_path)?;
        self.delimiter_byte()?;
        validation::validate_positive_number("file.batch_lines", self.file.batch_lines, 1)?;
        validation::validate_positive_number("file.start_line", self.file.start_line as usize, 1)?;
        if let Some(max_lines) = self.file.max_lines {
            validation::validate_positive_number("file.max_lines", max_lines as usize, 1)?;
        }
        validation::validate_path("file.log_dir", &self.file.log_dir)?;
        validation::validate_path("file.checkpoint_dir", &self.file.checkpoint_dir)?;

        for (i, column) in self.file.columns.iter().enumerate() {
            let field = format!("file.columns[{}]", i);
            validation::validate_non_empty_string(&format!("{}.column", field), &column.column)?;
            if let Some(pattern) = &column.regex {
                Regex::new(pattern).map_err(|e| EtlError::InvalidConfigValueError {
                    field: format!("{}.regex", field),
                    value: pattern.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        if self.endpoints.is_empty() {
            return Err(EtlError::MissingConfigError {
                field: "endpoints".to_string(),
            });
        }

        let mut names = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let field = format!("endpoints[{}]", i);
            validation::validate_non_empty_string(&format!("{}.name", field), &endpoint.name)?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(EtlError::InvalidConfigValueError {
                    field: format!("{}.name", field),
                    value: endpoint.name.clone(),
                    reason: "Duplicate endpoint name".to_string(),
                });
            }
            validation::validate_url(&format!("{}.url", field), &endpoint.url)?;
            validation::validate_positive_number(
                &format!("{}.retry_attempts", field),
                endpoint.retry_attempts as usize,
                1,
            )?;
            if let Some(rps) = endpoint.max_requests_per_second {
                validation::validate_positive_number(
                    &format!("{}.max_requests_per_second", field),
                    rps as usize,
                    1,
                )?;
            }

            for (j, mapping) in endpoint.mapping.iter().enumerate() {
                mapping.validate_sources(&format!("{}.mapping[{}]", field, j))?;
            }
            validate_mapping_paths(endpoint)?;
        }

        if let Some(default_name) = &self.routing.default_endpoint {
            if self.endpoint(default_name).is_none() {
                return Err(EtlError::InvalidConfigValueError {
                    field: "routing.default_endpoint".to_string(),
                    value: default_name.clone(),
                    reason: "No endpoint with this name is configured".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// 同一端點中，若某個屬性路徑是另一個路徑的前綴，葉節點會與物件衝突
fn validate_mapping_paths(endpoint: &Endpoint) -> Result<()> {
    let paths: Vec<Vec<&str>> = endpoint
        .mapping
        .iter()
        .map(|m| m.attribute.split('.').collect())
        .collect();

    for (i, a) in paths.iter().enumerate() {
        for b in paths.iter().skip(i + 1) {
            let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
            if short.len() < long.len() && long.starts_with(short) {
                return Err(EtlError::ConfigValidationError {
                    field: format!("endpoints.{}.mapping", endpoint.name),
                    message: format!(
                        "attribute '{}' is both a value and the parent of '{}'",
                        short.join("."),
                        long.join(".")
                    ),
                });
            }
        }
    }
    Ok(())
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_with_input(input: &str, endpoints: &str) -> String {
        format!(
            r#"
[file]
input_path = "{}"
batch_lines = 10

[[file.columns]]
column = "email"
regex = "^[^@]+@[^@]+$"

[[file.columns.filters]]
operator = "not_equals"
value = "skip"
case_insensitive = true

{}
"#,
            input.replace('\\', "/"),
            endpoints
        )
    }

    const ONE_ENDPOINT: &str = r#"
[[endpoints]]
name = "crm"
url = "https://api.example.com/contacts"
method = "PUT"
max_requests_per_second = 5

[endpoints.headers]
Authorization = "Bearer abc"

[[endpoints.mapping]]
attribute = "contact.email"
source_column = "email"
transforms = ["trim", "lowercase"]

[[endpoints.mapping]]
attribute = "source"
fixed_value = "import"
"#;

    #[test]
    fn test_parse_full_config() {
        let input = NamedTempFile::new().unwrap();
        let content = config_with_input(input.path().to_str().unwrap(), ONE_ENDPOINT);

        let config = AppConfig::from_toml_str(&content).unwrap();

        assert_eq!(config.file.batch_lines, 10);
        assert_eq!(config.file.delimiter, ",");
        assert_eq!(config.file.start_line, 1);
        assert_eq!(config.file.checkpoint_interval_seconds, 30);
        assert_eq!(config.file.columns[0].column_type, ColumnType::String);
        assert_eq!(config.file.columns[0].filters[0].operator, FilterOperator::NotEquals);
        assert_eq!(config.endpoints[0].method, HttpMethod::Put);
        assert_eq!(config.endpoints[0].retry_attempts, 3);
        assert_eq!(config.endpoints[0].max_requests_per_second, Some(5));
        assert_eq!(config.endpoints[0].mapping[0].transforms, vec!["trim", "lowercase"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("CSV_RELAY_TEST_TOKEN", "secret-token");

        let input = NamedTempFile::new().unwrap();
        let endpoints = r#"
[[endpoints]]
name = "crm"
url = "https://api.example.com"

[endpoints.headers]
Authorization = "Bearer ${CSV_RELAY_TEST_TOKEN}"
X-Missing = "${CSV_RELAY_NOT_DEFINED}"
"#;
        let content = config_with_input(input.path().to_str().unwrap(), endpoints);
        let config = AppConfig::from_toml_str(&content).unwrap();

        let headers = &config.endpoints[0].headers;
        assert_eq!(headers["Authorization"], "Bearer secret-token");
        assert_eq!(headers["X-Missing"], "${CSV_RELAY_NOT_DEFINED}");

        std::env::remove_var("CSV_RELAY_TEST_TOKEN");
    }

    #[test]
    fn test_mapping_with_fixed_value_and_column_is_rejected() {
        let input = NamedTempFile::new().unwrap();
        let endpoints = r#"
[[endpoints]]
name = "crm"
url = "https://api.example.com"

[[endpoints.mapping]]
attribute = "email"
source_column = "email"
fixed_value = "x@example.com"
"#;
        let content = config_with_input(input.path().to_str().unwrap(), endpoints);
        let config = AppConfig::from_toml_str(&content).unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, EtlError::ConfigValidationError { .. }));
    }

    #[test]
    fn test_whitespace_fixed_value_is_a_source() {
        let input = NamedTempFile::new().unwrap();
        let endpoints = r#"
[[endpoints]]
name = "crm"
url = "https://api.example.com"

[[endpoints.mapping]]
attribute = "separator"
fixed_value = " "
"#;
        let content = config_with_input(input.path().to_str().unwrap(), endpoints);
        let config = AppConfig::from_toml_str(&content).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mapping_without_source_is_rejected() {
        let input = NamedTempFile::new().unwrap();
        let endpoints = r#"
[[endpoints]]
name = "crm"
url = "https://api.example.com"

[[endpoints.mapping]]
attribute = "email"
"#;
        let content = config_with_input(input.path().to_str().unwrap(), endpoints);
        let config = AppConfig::from_toml_str(&content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_colliding_attribute_paths_are_rejected() {
        let input = NamedTempFile::new().unwrap();
        let endpoints = r#"
[[endpoints]]
name = "crm"
url = "https://api.example.com"

[[endpoints.mapping]]
attribute = "address"
source_column = "street"

[[endpoints.mapping]]
attribute = "address.city"
source_column = "city"
"#;
        let content = config_with_input(input.path().to_str().unwrap(), endpoints);
        let config = AppConfig::from_toml_str(&content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_endpoints_is_rejected() {
        let input = NamedTempFile::new().unwrap();
        let content = config_with_input(input.path().to_str().unwrap(), "");
        let config = AppConfig::from_toml_str(&content).unwrap();
        assert!(matches!(
            config.validate(),
            Err(EtlError::MissingConfigError { .. })
        ));
    }

    #[test]
    fn test_missing_input_file_is_rejected() {
        let content = config_with_input("/no/such/input.csv", ONE_ENDPOINT);
        let config = AppConfig::from_toml_str(&content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_default_endpoint_is_rejected() {
        let input = NamedTempFile::new().unwrap();
        let mut content = config_with_input(input.path().to_str().unwrap(), ONE_ENDPOINT);
        content.push_str("\n[routing]\ndefault_endpoint = \"erp\"\n");
        let config = AppConfig::from_toml_str(&content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_and_execution_paths() {
        let input = NamedTempFile::new().unwrap();
        let content = config_with_input(input.path().to_str().unwrap(), ONE_ENDPOINT);
        let mut config = AppConfig::from_toml_str(&content).unwrap();

        config.apply_overrides(&RunOverrides {
            batch_lines: Some(50),
            delimiter: Some(";".to_string()),
            start_line: Some(7),
            max_lines: Some(20),
            log_dir: Some("out/logs".to_string()),
            ..Default::default()
        });

        assert_eq!(config.file.batch_lines, 50);
        assert_eq!(config.delimiter_byte().unwrap(), b';');
        assert_eq!(config.file.start_line, 7);
        assert_eq!(config.file.max_lines, Some(20));

        let paths = config.execution_paths("abc");
        assert_eq!(paths.checkpoint_path, Path::new("checkpoints").join("checkpoint_abc.json"));
        assert_eq!(paths.log_path, Path::new("out/logs").join("process_abc.csv"));
    }

    #[test]
    fn test_config_from_file() {
        let input = NamedTempFile::new().unwrap();
        let mut temp_file = NamedTempFile::new().unwrap();
        let content = config_with_input(input.path().to_str().unwrap(), ONE_ENDPOINT);
        temp_file.write_all(content.as_bytes()).unwrap();

        let config = AppConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.endpoints[0].name, "crm");
    }
}
