use crate::domain::model::{Header, Record};
use crate::utils::error::{EtlError, Result};
use csv::{ByteRecord, Reader, ReaderBuilder};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// 逐行讀取分隔文字檔，只能向前讀，重新開檔才會從第 1 行開始
pub struct RecordSource {
    reader: Reader<File>,
    header: Arc<Header>,
    /// 最後讀到的行號，標題列為第 1 行
    line_number: u64,
    scratch: ByteRecord,
}

impl RecordSource {
    pub fn open<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self> {
        let mut reader = Self::reader_builder(delimiter).from_path(path.as_ref())?;

        let names: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();

        if names.iter().all(|n| n.is_empty()) {
            return Err(EtlError::MalformedInput {
                message: format!("{} has no header row", path.as_ref().display()),
            });
        }

        tracing::debug!("📄 Header: {:?}", names);

        Ok(Self {
            reader,
            header: Arc::new(Header::new(names)),
            line_number: 1,
            scratch: ByteRecord::new(),
        })
    }

    fn reader_builder(delimiter: u8) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder.delimiter(delimiter).has_headers(true).flexible(true);
        builder
    }

    pub fn header(&self) -> Arc<Header> {
        Arc::clone(&self.header)
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// 跳過 `start_line` 之前的資料行，不建立 Record，回傳跳過的行數
    pub fn skip_to(&mut self, start_line: u64) -> Result<u64> {
        let mut skipped = 0;
        while self.line_number + 1 < start_line {
            if !self.reader.read_byte_record(&mut self.scratch)? {
                break;
            }
            self.line_number += 1;
            skipped += 1;
        }
        Ok(skipped)
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if !self.reader.read_byte_record(&mut self.scratch)? {
            return Ok(None);
        }
        self.line_number += 1;

        let values = self
            .scratch
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect();

        Ok(Some(Record::new(
            self.line_number,
            Arc::clone(&self.header),
            values,
        )))
    }

    /// 計算資料行數（不含標題），用於進度估算
    pub fn count_records<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<u64> {
        let mut reader = Self::reader_builder(delimiter).from_path(path)?;
        let mut scratch = ByteRecord::new();
        let mut count = 0;
        while reader.read_byte_record(&mut scratch)? {
            count += 1;
        }
        Ok(count)
    }
}

impl Iterator for RecordSource {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
