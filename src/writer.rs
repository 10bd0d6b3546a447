use crate::executor::{MappingResult, TableOutput};
use crate::key::JoinKey;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes each table to its own JSON Lines file, `<dir>/<table>.jsonl`
pub struct TableWriter {
    dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl TableWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        std::fs::create_dir_all(&output_dir).context("Failed to create output directory")?;
        Ok(TableWriter {
            dir: output_dir.as_ref().to_path_buf(),
            writers: HashMap::new(),
        })
    }

    pub fn write_result<I: Serialize>(&mut self, result: &MappingResult<I>) -> Result<()> {
        for (table, output) in &result.tables {
            match output {
                TableOutput::Rows(rows) => self.write_table(table, rows.values())?,
                TableOutput::Instances(items) => self.write_table(table, items.values())?,
            }
        }
        Ok(())
    }

    fn write_table<'a, T: Serialize + 'a>(
        &mut self,
        table: &str,
        records: impl Iterator<Item = &'a T>,
    ) -> Result<()> {
        if !self.writers.contains_key(table) {
            let path = self.dir.join(format!("{}.jsonl", table));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open file: {}", path.display()))?;
            self.writers.insert(table.to_string(), BufWriter::new(file));
        }
        let Some(writer) = self.writers.get_mut(table) else {
            return Ok(());
        };
        for record in records {
            let json = serde_json::to_string(record).context("Failed to serialize record")?;
            writeln!(writer, "{}", json).context("Failed to write record")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush().context("Failed to flush writer")?;
        }
        Ok(())
    }
}

/// Writes every table to one stream, tagging records with `_table` and `_key`
pub struct SingleWriter<W: Write> {
    writer: W,
}

impl<W: Write> SingleWriter<W> {
    pub fn new(writer: W) -> Self {
        SingleWriter { writer }
    }

    pub fn write_result<I: Serialize>(&mut self, result: &MappingResult<I>) -> Result<()> {
        for (table, output) in &result.tables {
            match output {
                TableOutput::Rows(rows) => {
                    for (key, row) in rows {
                        self.write_record(table, key, row)?;
                    }
                }
                TableOutput::Instances(items) => {
                    for (key, item) in items {
                        self.write_record(table, key, item)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_record<T: Serialize>(&mut self, table: &str, key: &JoinKey, record: &T) -> Result<()> {
        let mut data = match serde_json::to_value(record).context("Failed to serialize record")? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        data.insert("_table".to_string(), Value::String(table.to_string()));
        data.insert("_key".to_string(), serde_json::to_value(key)?);

        let json = serde_json::to_string(&data).context("Failed to serialize record")?;
        writeln!(self.writer, "{}", json).context("Failed to write record")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush writer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::RowEmit;
    use crate::executor::{run_mapping, MappingSpec};
    use crate::transform::{get, index};
    use crate::traversal::{IterationMode, TraversalSpec};
    use serde_json::json;

    fn result() -> MappingResult {
        let data = json!({"users": [{"id": 1, "name": "Alice"}], "tags": ["x"]});
        let spec = MappingSpec::new()
            .traversal(
                TraversalSpec::new("users", IterationMode::Elements)
                    .emit(RowEmit::new("users").join_on(get("id")).field("name", get("name"))),
            )
            .traversal(
                TraversalSpec::new("tags", IterationMode::Elements)
                    .emit(RowEmit::new("tags").join_on(index()).join_on(get("")).field("tag", get(""))),
            );
        run_mapping(&data, &spec).unwrap()
    }

    #[test]
    fn test_single_writer() {
        let mut buffer = Vec::new();
        let mut writer = SingleWriter::new(&mut buffer);
        writer.write_result(&result()).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<Value> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], json!({"name": "Alice", "id": 1, "_table": "users", "_key": [1]}));
        assert_eq!(lines[1]["_key"], json!([0, "x"]));
    }

    #[test]
    fn test_table_writer() {
        let dir = std::env::temp_dir().join(format!("ingot-writer-{}", std::process::id()));
        let mut writer = TableWriter::new(&dir).unwrap();
        writer.write_result(&result()).unwrap();
        writer.flush().unwrap();

        let users = std::fs::read_to_string(dir.join("users.jsonl")).unwrap();
        assert_eq!(users.trim(), r#"{"name":"Alice","id":1}"#);
        assert!(dir.join("tags.jsonl").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
