use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, RouterError};
use crate::record::{FieldSpec, Format, Layout, Payload, Record};

/// A file sink or source as declared in a graph description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub filetype: Format,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_units: Vec<String>,
    /// C-style row format of `table` files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl FileSpec {
    pub fn new(path: impl Into<PathBuf>, filetype: Format) -> Self {
        Self {
            path: path.into(),
            filetype,
            field_names: Vec::new(),
            field_units: Vec::new(),
            format: None,
        }
    }

    /// Serialization layout described by this spec.
    pub fn layout(&self) -> Result<Layout> {
        if !self.field_units.is_empty() && self.field_units.len() != self.field_names.len() {
            return Err(RouterError::Configuration(format!(
                "{}: {} field units for {} field names",
                self.path.display(),
                self.field_units.len(),
                self.field_names.len()
            )));
        }
        let fields = self
            .field_names
            .iter()
            .enumerate()
            .map(|(i, name)| FieldSpec {
                name: name.clone(),
                units: self.field_units.get(i).cloned(),
            })
            .collect();

        match self.filetype {
            Format::Table => Layout::table(fields, self.format.as_deref()),
            Format::Json => Ok(Layout::json(fields)),
            Format::Raw => Ok(Layout {
                fields,
                ..Layout::raw()
            }),
        }
    }
}

/// Destination that writes routed messages to a file.
///
/// The file is created on the first write and stays open until
/// [`FileSink::finish`]. Heartbeats never reach a sink.
pub struct FileSink {
    path: PathBuf,
    layout: Layout,
    writer: Option<BufWriter<File>>,
    header_written: bool,
    rows: u64,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            path: path.into(),
            layout,
            writer: None,
            header_written: false,
            rows: 0,
        }
    }

    pub fn from_spec(spec: &FileSpec) -> Result<Self> {
        Ok(Self::new(spec.path.clone(), spec.layout()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Messages written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn open(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = File::create(&self.path)?;
            info!(path = ?self.path, format = %self.layout.format, "file sink opened");
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| RouterError::Configuration("file sink not open".to_string()))
    }

    /// Write one message.
    pub fn write(&mut self, payload: &Payload) -> Result<()> {
        let name = self.path.display().to_string();
        let bytes: Bytes = match (self.layout.format, payload) {
            (Format::Table, Payload::Record(record)) => {
                let record = self.layout.conform(&name, record)?;
                if !self.header_written {
                    let header = table_header(&self.layout, &record);
                    self.open()?.write_all(header.as_bytes())?;
                    self.header_written = true;
                }
                Bytes::from(self.layout.encode_row(&name, &record)?)
            }
            (Format::Json, _) => {
                let mut line = self.layout.encode(&name, payload)?.to_vec();
                line.push(b'\n');
                Bytes::from(line)
            }
            _ => self.layout.encode(&name, payload)?,
        };

        let writer = self.open()?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and close the file. Later writes reopen and truncate it, so
    /// this is only called once the last feeding source has finished.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(path = ?self.path, rows = self.rows, "file sink closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("format", &self.layout.format)
            .field("rows", &self.rows)
            .finish()
    }
}

/// `# name1\tname2` header plus a `# unit1\tunit2` line when any field
/// carries units.
fn table_header(layout: &Layout, record: &Record) -> String {
    let names: Vec<&str> = record.names();
    let mut header = format!("# {}\n", names.join("\t"));

    let has_units = layout.has_units() || record.fields().iter().any(|f| f.units.is_some());
    if has_units {
        let units: Vec<&str> = record
            .fields()
            .iter()
            .map(|f| f.units.as_deref().unwrap_or("-"))
            .collect();
        header.push_str(&format!("# {}\n", units.join("\t")));
    }
    header
}

/// A file replayed as a message source: one message per row or line.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    layout: Layout,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            path: path.into(),
            layout,
        }
    }

    pub fn from_spec(spec: &FileSpec) -> Result<Self> {
        Ok(Self::new(spec.path.clone(), spec.layout()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Read every message in the file.
    ///
    /// Table files may start with `#` header lines; when no field names are
    /// declared the first one names the columns and the second their units.
    /// Blank lines are skipped.
    pub fn read(&self) -> Result<Vec<Payload>> {
        let name = self.path.display().to_string();
        let content = std::fs::read(&self.path)?;
        let lines = content
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace));

        match self.layout.format {
            Format::Raw => Ok(lines
                .map(|line| Payload::Raw(Bytes::copy_from_slice(line)))
                .collect()),
            Format::Json => lines
                .map(|line| {
                    let value: serde_json::Value = serde_json::from_slice(line)?;
                    let serde_json::Value::Object(map) = value else {
                        return Err(RouterError::Decode {
                            endpoint: name.clone(),
                            message: "expected one JSON object per line".to_string(),
                        });
                    };
                    self.layout
                        .record_from_map(&name, &map)
                        .map(Payload::Record)
                })
                .collect(),
            Format::Table => {
                let mut layout = self.layout.clone();
                let mut comments = Vec::new();
                let mut rows = Vec::new();
                for line in lines {
                    let text = std::str::from_utf8(line).map_err(|err| RouterError::Decode {
                        endpoint: name.clone(),
                        message: err.to_string(),
                    })?;
                    match text.trim_start().strip_prefix('#') {
                        Some(comment) if rows.is_empty() => comments.push(comment.trim()),
                        Some(_) => {}
                        None => rows.push(text),
                    }
                }
                if layout.fields.is_empty() {
                    layout.fields = header_fields(&comments);
                }
                rows.into_iter()
                    .map(|row| layout.decode_row(&name, row).map(Payload::Record))
                    .collect()
            }
        }
    }
}

fn header_fields(comments: &[&str]) -> Vec<FieldSpec> {
    let Some(names) = comments.first() else {
        return Vec::new();
    };
    let units: Vec<&str> = comments
        .get(1)
        .map(|line| line.split('\t').map(str::trim).collect())
        .unwrap_or_default();
    names
        .split('\t')
        .map(str::trim)
        .enumerate()
        .map(|(i, name)| FieldSpec {
            name: name.to_string(),
            units: units
                .get(i)
                .filter(|u| !u.is_empty() && **u != "-")
                .map(|u| u.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn rate_spec(path: PathBuf) -> FileSpec {
        FileSpec {
            field_names: vec!["InputMassRate".into(), "OuputMassRate".into()],
            format: Some("%.1lf\t%.1lf\n".into()),
            ..FileSpec::new(path, Format::Table)
        }
    }

    #[test]
    fn table_sink_writes_header_once_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut sink = FileSink::from_spec(&rate_spec(path.clone())).unwrap();
        assert!(!path.exists(), "sink opens lazily");

        let record = Record::new().with("in_val_copy", 50i64).with("out_val", 60i64);
        sink.write(&Payload::Record(record.clone())).unwrap();
        sink.write(&Payload::Record(record)).unwrap();
        sink.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "# InputMassRate\tOuputMassRate\n50.0\t60.0\n50.0\t60.0\n"
        );
        assert_eq!(sink.rows_written(), 2);
    }

    #[test]
    fn table_sink_writes_units_line() {
        let dir = tempfile::tempdir().unwrap();
        let spec = FileSpec {
            field_names: vec!["t".into(), "q".into()],
            field_units: vec!["s".into(), "kg/s".into()],
            ..FileSpec::new(dir.path().join("units.txt"), Format::Table)
        };
        let mut sink = FileSink::from_spec(&spec).unwrap();
        sink.write(&Payload::Record(Record::new().with("a", 1i64).with("b", 2.5)))
            .unwrap();

        let content = std::fs::read_to_string(&spec.path).unwrap();
        assert_eq!(content, "# t\tq\n# s\tkg/s\n1\t2.5\n");
    }

    #[test]
    fn json_and_raw_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("out.jsonl");
        let mut json = FileSink::new(&json_path, Layout::json(Vec::new()));
        json.write(&Payload::Record(Record::new().with("x", 1i64)))
            .unwrap();
        json.write(&Payload::Record(Record::new().with("x", 2i64)))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&json_path).unwrap(),
            "{\"x\":1}\n{\"x\":2}\n"
        );

        let raw_path = dir.path().join("out.bin");
        let mut raw = FileSink::new(&raw_path, Layout::raw());
        raw.write(&Payload::Raw(Bytes::from_static(b"ab")))
            .unwrap();
        raw.write(&Payload::Raw(Bytes::from_static(b"cd")))
            .unwrap();
        assert_eq!(std::fs::read(&raw_path).unwrap(), b"abcd");
    }

    #[test]
    fn mismatched_units_are_configuration_errors() {
        let spec = FileSpec {
            field_names: vec!["a".into(), "b".into()],
            field_units: vec!["m".into()],
            ..FileSpec::new("x.txt", Format::Table)
        };
        assert!(matches!(spec.layout(), Err(RouterError::Configuration(_))));
    }

    #[test]
    fn table_source_reads_what_sink_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "# a\tb\n# m\t-\n1\t2\n\n3\t4\n").unwrap();

        let source = FileSource::new(&path, Layout::table(Vec::new(), None).unwrap());
        let messages = source.read().unwrap();
        assert_eq!(messages.len(), 2);

        let Payload::Record(first) = &messages[0] else {
            panic!("expected a record");
        };
        assert_eq!(first.names(), vec!["a", "b"]);
        assert_eq!(first.field("a").unwrap().units.as_deref(), Some("m"));
        assert_eq!(first.field("b").unwrap().units, None);
        assert_eq!(first.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn table_source_with_declared_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.txt");
        std::fs::write(&path, "# InputMassRate\tOuputMassRate\n50.0\t60.0\n").unwrap();

        let source = FileSource::from_spec(&rate_spec(path)).unwrap();
        let messages = source.read().unwrap();
        assert_eq!(
            messages,
            vec![Payload::Record(
                Record::new()
                    .with("InputMassRate", 50.0)
                    .with("OuputMassRate", 60.0)
            )]
        );
    }

    #[test]
    fn json_and_raw_sources() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("in.jsonl");
        std::fs::write(&json_path, "{\"x\": 1}\n{\"x\": 2}\n").unwrap();
        let json = FileSource::new(&json_path, Layout::json(Vec::new()));
        assert_eq!(json.read().unwrap().len(), 2);

        let raw_path = dir.path().join("in.txt");
        std::fs::write(&raw_path, "one\r\ntwo\n").unwrap();
        let raw = FileSource::new(&raw_path, Layout::raw());
        assert_eq!(
            raw.read().unwrap(),
            vec![
                Payload::Raw(Bytes::from_static(b"one")),
                Payload::Raw(Bytes::from_static(b"two")),
            ]
        );

        std::fs::write(&json_path, "[1]\n").unwrap();
        assert!(json.read().is_err());
    }
}
