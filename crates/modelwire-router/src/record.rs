use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number};

use crate::cformat::CFormat;
use crate::error::{Result, RouterError};

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    /// Numeric view of the value. Booleans count as 0 and 1; text is not
    /// numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Str(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float)),
            serde_json::Value::String(s) => Some(Value::Str(s.clone())),
            _ => None,
        }
    }

    /// JSON form of the value. Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Parse a bare table token: integer, float, boolean or text.
    pub fn parse_token(token: &str) -> Self {
        if let Ok(n) = token.parse::<i64>() {
            Value::Int(n)
        } else if let Ok(f) = token.parse::<f64>() {
            Value::Float(f)
        } else if token.eq_ignore_ascii_case("true") {
            Value::Bool(true)
        } else if token.eq_ignore_ascii_case("false") {
            Value::Bool(false)
        } else {
            Value::Str(token.to_string())
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

/// One named, optionally unit-bearing field of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub units: Option<String>,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            units: None,
            value: value.into(),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

/// An ordered sequence of fields. Cloning gives an independent copy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<Field>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(Field::new(name, value));
        self
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.field(name).map(|f| &f.value)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Replace the value of `name`, appending the field if it is new.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field::new(name, value)),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut [Field] {
        &mut self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.fields.iter().map(|f| f.value.clone()).collect()
    }

    /// JSON object with fields in record order.
    pub fn to_json(&self) -> serde_json::Value {
        let map: Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<Field> for Record {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// How an endpoint's messages are serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Opaque bytes.
    #[default]
    Raw,
    /// One JSON object per message.
    Json,
    /// One formatted text row per message.
    Table,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Raw => "raw",
            Format::Json => "json",
            Format::Table => "table",
        })
    }
}

/// A declared field: name plus optional physical units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

/// A message in flight: opaque bytes or a decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Bytes),
    Record(Record),
}

/// Serialization layout of one endpoint, file sink or file source.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub format: Format,
    pub fields: Vec<FieldSpec>,
    /// Row format of `table` layouts. Without one, rows are tab separated.
    pub row: Option<CFormat>,
}

impl Layout {
    pub fn raw() -> Self {
        Self::default()
    }

    pub fn json(fields: Vec<FieldSpec>) -> Self {
        Self {
            format: Format::Json,
            fields,
            row: None,
        }
    }

    pub fn table(fields: Vec<FieldSpec>, row: Option<&str>) -> Result<Self> {
        Ok(Self {
            format: Format::Table,
            fields,
            row: row.map(CFormat::parse).transpose()?,
        })
    }

    /// True if any declared field carries units.
    pub fn has_units(&self) -> bool {
        self.fields.iter().any(|f| f.units.is_some())
    }

    /// Decode a message received on `endpoint`.
    pub fn decode(&self, endpoint: &str, payload: &Bytes) -> Result<Payload> {
        let decode_err = |message: String| RouterError::Decode {
            endpoint: endpoint.to_string(),
            message,
        };
        match self.format {
            Format::Raw => Ok(Payload::Raw(payload.clone())),
            Format::Json => {
                let value: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|err| decode_err(err.to_string()))?;
                let serde_json::Value::Object(map) = value else {
                    return Err(decode_err("expected a JSON object".to_string()));
                };
                self.record_from_map(endpoint, &map).map(Payload::Record)
            }
            Format::Table => {
                let line = std::str::from_utf8(payload)
                    .map_err(|err| decode_err(err.to_string()))?;
                self.decode_row(endpoint, line).map(Payload::Record)
            }
        }
    }

    /// Encode a payload for delivery to `endpoint`.
    ///
    /// Raw payloads pass through untouched. Records are first conformed to
    /// the declared fields; `raw` layouts carry records as JSON.
    pub fn encode(&self, endpoint: &str, payload: &Payload) -> Result<Bytes> {
        let record = match payload {
            Payload::Raw(bytes) => return Ok(bytes.clone()),
            Payload::Record(record) => self.conform(endpoint, record)?,
        };
        match self.format {
            Format::Raw | Format::Json => Ok(Bytes::from(serde_json::to_vec(&record.to_json())?)),
            Format::Table => Ok(Bytes::from(self.encode_row(endpoint, &record)?)),
        }
    }

    pub(crate) fn record_from_map(
        &self,
        endpoint: &str,
        map: &Map<String, serde_json::Value>,
    ) -> Result<Record> {
        let mut record = Record::new();
        for spec in &self.fields {
            let value = map.get(&spec.name).ok_or_else(|| RouterError::Decode {
                endpoint: endpoint.to_string(),
                message: format!("missing field '{}'", spec.name),
            })?;
            record.push(Field {
                name: spec.name.clone(),
                units: spec.units.clone(),
                value: json_value(endpoint, &spec.name, value)?,
            });
        }
        for (name, value) in map {
            if self.fields.iter().any(|spec| &spec.name == name) {
                continue;
            }
            record.push(Field::new(name.clone(), json_value(endpoint, name, value)?));
        }
        Ok(record)
    }

    pub(crate) fn decode_row(&self, endpoint: &str, line: &str) -> Result<Record> {
        let values = match &self.row {
            Some(format) => format.scan(line).map_err(|err| RouterError::Decode {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })?,
            None => line.split_whitespace().map(Value::parse_token).collect(),
        };

        if !self.fields.is_empty() && values.len() != self.fields.len() {
            return Err(RouterError::Decode {
                endpoint: endpoint.to_string(),
                message: format!(
                    "row has {} values, {} fields declared",
                    values.len(),
                    self.fields.len()
                ),
            });
        }

        Ok(values
            .into_iter()
            .enumerate()
            .map(|(i, value)| match self.fields.get(i) {
                Some(spec) => Field {
                    name: spec.name.clone(),
                    units: spec.units.clone(),
                    value,
                },
                None => Field::new(format!("column{}", i + 1), value),
            })
            .collect())
    }

    pub(crate) fn encode_row(&self, endpoint: &str, record: &Record) -> Result<String> {
        let values = record.values();
        match &self.row {
            Some(format) => format.format(&values).map_err(|err| RouterError::Encode {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }),
            None => {
                let cells: Vec<String> = values.iter().map(Value::to_string).collect();
                Ok(cells.join("\t") + "\n")
            }
        }
    }

    /// Reshape `record` to the declared fields.
    ///
    /// Declared names are looked up in the record first; when they are not
    /// all present and the field counts agree, fields are matched by
    /// position and renamed. Declared units win over the record's.
    pub fn conform(&self, endpoint: &str, record: &Record) -> Result<Record> {
        if self.fields.is_empty() {
            return Ok(record.clone());
        }

        let by_name: Option<Vec<&Field>> = self
            .fields
            .iter()
            .map(|spec| record.field(&spec.name))
            .collect();
        let matched: Vec<&Field> = match by_name {
            Some(fields) => fields,
            None if record.len() == self.fields.len() => record.fields().iter().collect(),
            None => {
                return Err(RouterError::Encode {
                    endpoint: endpoint.to_string(),
                    message: format!(
                        "record fields {:?} do not match declared fields {:?}",
                        record.names(),
                        self.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>()
                    ),
                });
            }
        };

        Ok(self
            .fields
            .iter()
            .zip(matched)
            .map(|(spec, field)| Field {
                name: spec.name.clone(),
                units: spec.units.clone().or_else(|| field.units.clone()),
                value: field.value.clone(),
            })
            .collect())
    }
}

fn json_value(endpoint: &str, name: &str, value: &serde_json::Value) -> Result<Value> {
    Value::from_json(value).ok_or_else(|| RouterError::Decode {
        endpoint: endpoint.to_string(),
        message: format!("field '{name}' is not a number, boolean or string"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_independent() {
        let original = Record::new().with("x", 10i64);
        let mut copy = original.clone();
        copy.set("x", 50i64);

        assert_eq!(original.get("x"), Some(&Value::Int(10)));
        assert_eq!(copy.get("x"), Some(&Value::Int(50)));
    }

    #[test]
    fn json_decode_orders_declared_fields_first() {
        let layout = Layout::json(vec![
            FieldSpec::new("b").with_units("kg"),
            FieldSpec::new("a"),
        ]);
        let payload = Bytes::from_static(br#"{"a": 1, "extra": "x", "b": 2.5}"#);

        let Payload::Record(record) = layout.decode("in", &payload).unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(record.names(), vec!["b", "a", "extra"]);
        assert_eq!(record.field("b").unwrap().units.as_deref(), Some("kg"));
        assert_eq!(record.get("b"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn json_decode_rejects_missing_and_nested() {
        let layout = Layout::json(vec![FieldSpec::new("a")]);
        assert!(matches!(
            layout.decode("in", &Bytes::from_static(b"{}")),
            Err(RouterError::Decode { .. })
        ));

        let open = Layout::json(Vec::new());
        assert!(open
            .decode("in", &Bytes::from_static(br#"{"a": [1]}"#))
            .is_err());
        assert!(open.decode("in", &Bytes::from_static(b"[1, 2]")).is_err());
    }

    #[test]
    fn table_row_round_trip_with_format() {
        let layout = Layout::table(
            vec![FieldSpec::new("InputMassRate"), FieldSpec::new("OuputMassRate")],
            Some("%.1lf\t%.1lf\n"),
        )
        .unwrap();
        let record = Record::new().with("in_val_copy", 50i64).with("out_val", 60i64);

        let encoded = layout.encode("sink", &Payload::Record(record)).unwrap();
        assert_eq!(encoded.as_ref(), b"50.0\t60.0\n");

        let Payload::Record(decoded) = layout.decode("sink", &encoded).unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(decoded.names(), vec!["InputMassRate", "OuputMassRate"]);
        assert_eq!(decoded.get("OuputMassRate"), Some(&Value::Float(60.0)));
    }

    #[test]
    fn table_row_without_format_is_tab_separated() {
        let layout = Layout::table(Vec::new(), None).unwrap();
        let Payload::Record(record) = layout
            .decode("t", &Bytes::from_static(b"1 2.5 true pump\n"))
            .unwrap()
        else {
            panic!("expected a record");
        };
        assert_eq!(
            record.values(),
            vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Bool(true),
                Value::Str("pump".into())
            ]
        );
        assert_eq!(record.names()[0], "column1");

        let row = layout.encode("t", &Payload::Record(record)).unwrap();
        assert_eq!(row.as_ref(), b"1\t2.5\ttrue\tpump\n");
    }

    #[test]
    fn table_row_field_count_must_match() {
        let layout = Layout::table(vec![FieldSpec::new("a")], None).unwrap();
        assert!(layout.decode("t", &Bytes::from_static(b"1 2\n")).is_err());
    }

    #[test]
    fn conform_prefers_names_then_position() {
        let layout = Layout::json(vec![FieldSpec::new("y"), FieldSpec::new("x")]);
        let named = Record::new().with("x", 1i64).with("y", 2i64).with("z", 3i64);
        let conformed = layout.conform("d", &named).unwrap();
        assert_eq!(conformed.values(), vec![Value::Int(2), Value::Int(1)]);

        let positional = Record::new().with("a", 1i64).with("b", 2i64);
        let renamed = layout.conform("d", &positional).unwrap();
        assert_eq!(renamed.names(), vec!["y", "x"]);

        let short = Record::new().with("a", 1i64);
        assert!(matches!(
            layout.conform("d", &short),
            Err(RouterError::Encode { .. })
        ));
    }

    #[test]
    fn raw_layout_passes_bytes_and_carries_records_as_json() {
        let layout = Layout::raw();
        let bytes = Bytes::from_static(b"\x00\x01opaque");
        assert_eq!(
            layout.encode("r", &Payload::Raw(bytes.clone())).unwrap(),
            bytes
        );

        let record = Record::new().with("x", 1.5);
        let encoded = layout.encode("r", &Payload::Record(record)).unwrap();
        assert_eq!(encoded.as_ref(), br#"{"x":1.5}"#);
    }

    #[test]
    fn parse_token_types() {
        assert_eq!(Value::parse_token("-3"), Value::Int(-3));
        assert_eq!(Value::parse_token("1e2"), Value::Float(100.0));
        assert_eq!(Value::parse_token("FALSE"), Value::Bool(false));
        assert_eq!(Value::parse_token("n/a"), Value::Str("n/a".into()));
    }
}
