//! CSV file source (spec.md §2 component table, §8 worked example
//! "Polling CSV → JSON stdout").
//!
//! Unlike the row-polling sources, a CSV source reads each matched file
//! exactly once in order and returns `Ok(None)` for good once exhausted —
//! there is no cursor to advance. Path expansion via `glob` mirrors the
//! teacher's `source_csv.rs`, reworked from an Arrow `RecordBatch` reader
//! onto per-row `Message`s.

use std::collections::HashMap;
use std::fs::File;

use async_trait::async_trait;
use hermod_core::config::CsvSourceSpec;
use hermod_core::{HermodError, Message, Operation, Source};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct CsvSource {
    spec: CsvSourceSpec,
    paths: Vec<String>,
    current_file: usize,
    reader: Option<csv::Reader<File>>,
    exhausted: bool,
}

impl CsvSource {
    pub fn try_new(spec: CsvSourceSpec) -> Result<Self, HermodError> {
        let paths = glob::glob(&spec.path)
            .map_err(|e| HermodError::Configuration(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>();
        if paths.is_empty() {
            return Err(HermodError::Configuration(format!(
                "no files matched: {}",
                spec.path
            )));
        }
        Ok(Self {
            spec,
            paths,
            current_file: 0,
            reader: None,
            exhausted: false,
        })
    }

    fn open_reader(&mut self, index: usize) -> Result<csv::Reader<File>, HermodError> {
        let path = &self.paths[index];
        let file = File::open(path).map_err(|e| HermodError::TransientIo(e.into()))?;
        let mut builder = csv::ReaderBuilder::new();
        builder.has_headers(self.spec.has_header);
        if let Some(delim) = self.spec.delimiter {
            builder.delimiter(delim as u8);
        }
        info!(path, "opened csv file");
        Ok(builder.from_reader(file))
    }

    fn next_row(&mut self) -> Result<Option<HashMap<String, serde_json::Value>>, HermodError> {
        loop {
            if self.reader.is_none() {
                if self.current_file >= self.paths.len() {
                    return Ok(None);
                }
                self.reader = Some(self.open_reader(self.current_file)?);
            }

            let reader = self.reader.as_mut().unwrap();
            let headers = if self.spec.has_header {
                reader
                    .headers()
                    .map_err(|e| HermodError::TransientIo(e.into()))?
                    .clone()
            } else {
                csv::StringRecord::new()
            };

            let mut record = csv::StringRecord::new();
            match reader.read_record(&mut record) {
                Ok(true) => {
                    let mut row = HashMap::new();
                    if self.spec.has_header {
                        for (i, field) in record.iter().enumerate() {
                            let key = headers
                                .get(i)
                                .map(str::to_string)
                                .unwrap_or_else(|| format!("col{i}"));
                            row.insert(key, serde_json::Value::String(field.to_string()));
                        }
                    } else {
                        for (i, field) in record.iter().enumerate() {
                            row.insert(format!("col{i}"), serde_json::Value::String(field.to_string()));
                        }
                    }
                    return Ok(Some(row));
                }
                Ok(false) => {
                    self.reader = None;
                    self.current_file += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "csv read error");
                    return Err(HermodError::TransientIo(e.into()));
                }
            }
        }
    }
}

#[async_trait]
impl Source for CsvSource {
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, HermodError> {
        if self.exhausted || cancel.is_cancelled() {
            return Ok(None);
        }
        match self.next_row()? {
            Some(row) => {
                let mut msg = Message::default();
                msg.set_operation(Operation::Create)
                    .set_metadata("source", "csv")
                    .set_metadata("path", self.paths[self.current_file.min(self.paths.len() - 1)].clone());
                msg.set_after(serde_json::to_vec(&row).unwrap_or_default());
                msg.set_data(row);
                Ok(Some(msg))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, _msg: &Message) -> Result<(), HermodError> {
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HermodError> {
        Ok(())
    }

    async fn is_ready(&mut self) -> Result<(), HermodError> {
        if self.paths.is_empty() {
            return Err(HermodError::Configuration(format!(
                "no files matched: {}",
                self.spec.path
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HermodError> {
        self.reader = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn reads_rows_then_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "in.csv", "id,name\n1,John\n2,Jane\n");
        let spec = CsvSourceSpec {
            id: "csv-in".to_string(),
            path,
            has_header: true,
            delimiter: None,
        };
        let mut source = CsvSource::try_new(spec).unwrap();
        let cancel = CancellationToken::new();

        let msg1 = source.read(&cancel).await.unwrap().unwrap();
        assert_eq!(msg1.data().get("name").unwrap().as_str(), Some("John"));

        let msg2 = source.read(&cancel).await.unwrap().unwrap();
        assert_eq!(msg2.data().get("name").unwrap().as_str(), Some("Jane"));

        assert!(source.read(&cancel).await.unwrap().is_none());
    }

    #[test]
    fn missing_glob_match_is_configuration_error() {
        let spec = CsvSourceSpec {
            id: "csv-in".to_string(),
            path: "/no/such/path/*.csv".to_string(),
            has_header: true,
            delimiter: None,
        };
        assert!(CsvSource::try_new(spec).is_err());
    }
}
