use crate::domain::model::{Header, Record};
use crate::utils::error::Result;
use csv::{Writer, WriterBuilder};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 失敗記錄的 CSV 日誌：`LineNumber,<原始欄位...>,HttpCode,ErrorMessage`
pub struct ErrorLog {
    path: PathBuf,
    writer: Mutex<Writer<File>>,
}

impl ErrorLog {
    /// 以附加模式開啟；新檔或空檔才寫標題列，續傳時沿用同一份檔案
    pub fn open<P: AsRef<Path>>(path: P, header: &Header) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = WriterBuilder::new().flexible(true).from_writer(file);
        if needs_header {
            let mut row = Vec::with_capacity(header.len() + 3);
            row.push("LineNumber");
            row.extend(header.names().iter().map(String::as_str));
            row.push("HttpCode");
            row.push("ErrorMessage");
            writer.write_record(&row)?;
            writer.flush()?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &Record, http_code: u16, message: &str) -> Result<()> {
        let line = record.line_number().to_string();
        let code = http_code.to_string();

        let mut row: Vec<&str> = Vec::with_capacity(record.header().len() + 3);
        row.push(&line);
        row.extend(record.fields().map(|(_, value)| value));
        row.push(&code);
        row.push(message);

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}
