#[cfg(feature = "cli")]
pub mod cli;
pub mod toml_config;

pub use toml_config::{
    AppConfig, ColumnFilter, ColumnSpec, ColumnType, Endpoint, FieldMapping, FileConfig,
    FilterOperator, HttpMethod, RoutingConfig,
};

/// 命令列可覆蓋的檔案設定
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub input_path: Option<String>,
    pub batch_lines: Option<usize>,
    pub delimiter: Option<String>,
    pub start_line: Option<u64>,
    pub max_lines: Option<u64>,
    pub log_dir: Option<String>,
}
