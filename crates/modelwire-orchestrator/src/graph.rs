use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use modelwire_comm::TransportKind;
use modelwire_router::{FieldSpec, FileSpec, Format, Layout, TransformSpec};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// A model graph as written in a YAML or JSON description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Graph {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

/// Run-wide overrides. Anything left out keeps its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    pub poll_interval_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub recv_timeout_ms: Option<u64>,
    pub recv_retries: Option<u32>,
    pub rpc_timeout_ms: Option<u64>,
    pub rpc_retries: Option<u32>,
    pub reassembly_timeout_ms: Option<u64>,
    pub log_dir: Option<PathBuf>,
}

/// Implementation language of a model, which decides how it is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Executable,
    C,
    #[serde(alias = "c++")]
    Cpp,
    Fortran,
    Python,
    R,
    #[serde(alias = "bash", alias = "sh")]
    Shell,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Language::Executable => "executable",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Fortran => "fortran",
            Language::Python => "python",
            Language::R => "r",
            Language::Shell => "shell",
        })
    }
}

/// One model process and the endpoints it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub name: String,
    pub language: Language,
    /// Program and arguments. For interpreted languages the first entry is
    /// the script.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Stay in `Starting` until every queue endpoint has registered.
    #[serde(default)]
    pub wait_for_connect: bool,
    #[serde(default)]
    pub inputs: Vec<EndpointSpec>,
    #[serde(default)]
    pub outputs: Vec<EndpointSpec>,
    /// Service this model answers requests for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_server: Option<String>,
    /// Services this model calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpc_clients: Vec<String>,
}

impl ModelSpec {
    /// Every endpoint name this model binds, RPC queues included.
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .map(|e| e.name.clone())
            .collect();
        for service in self.rpc_server.iter().chain(&self.rpc_clients) {
            names.push(modelwire_comm::request_endpoint(service));
            names.push(modelwire_comm::response_endpoint(service));
        }
        names
    }
}

/// A model input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSpec {
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub format: Format,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSpec>,
    /// C-style row format of `table` endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_format: Option<String>,
    /// JSON Schema every delivered record must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<serde_json::Value>,
}

impl EndpointSpec {
    pub fn new(name: impl Into<String>, format: Format) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Queue,
            format,
            fields: Vec::new(),
            row_format: None,
            datatype: None,
        }
    }

    pub fn layout(&self) -> modelwire_router::Result<Layout> {
        match self.format {
            Format::Raw => Ok(Layout {
                fields: self.fields.clone(),
                ..Layout::raw()
            }),
            Format::Json => Ok(Layout::json(self.fields.clone())),
            Format::Table => Layout::table(self.fields.clone(), self.row_format.as_deref()),
        }
    }
}

/// One source feeding one or more destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSpec {
    /// Output endpoint the messages come from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// File replayed as the source instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_file: Option<FileSpec>,
    pub to: Vec<DestinationSpec>,
}

impl ConnectionSpec {
    /// Router name of the source: the endpoint, or `file:<path>`.
    pub fn source_name(&self) -> Option<String> {
        match (&self.from, &self.from_file) {
            (Some(endpoint), None) => Some(endpoint.clone()),
            (None, Some(file)) => Some(file_component(file)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
}

impl DestinationSpec {
    /// Router name of the destination: the endpoint, or `file:<path>`.
    pub fn destination_name(&self) -> Option<String> {
        match (&self.input, &self.file) {
            (Some(endpoint), None) => Some(endpoint.clone()),
            (None, Some(file)) => Some(file_component(file)),
            _ => None,
        }
    }
}

/// Name under which a file source or sink is routed and reported.
pub fn file_component(file: &FileSpec) -> String {
    format!("file:{}", file.path.display())
}

impl Graph {
    /// Load a description, picking the parser from the file extension.
    ///
    /// Relative paths inside the description are resolved against the
    /// directory holding it, and models without a `working_dir` run there.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut graph = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            _ => Self::from_yaml_str(&text)?,
        };

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = std::fs::canonicalize(&base).unwrap_or(base);
        graph.resolve_paths(&base);
        debug!(
            ?path,
            models = graph.models.len(),
            connections = graph.connections.len(),
            "graph loaded"
        );
        Ok(graph)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Anchor every relative path at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        if let Some(dir) = self.run.log_dir.as_mut() {
            anchor(dir);
        }
        for model in &mut self.models {
            match model.working_dir.as_mut() {
                Some(dir) => anchor(dir),
                None => model.working_dir = Some(base.to_path_buf()),
            }
        }
        for connection in &mut self.connections {
            if let Some(file) = connection.from_file.as_mut() {
                anchor(&mut file.path);
            }
            for destination in &mut connection.to {
                if let Some(file) = destination.file.as_mut() {
                    anchor(&mut file.path);
                }
            }
        }
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Model owning the endpoint, RPC queues resolving to the server.
    pub fn owner_of(&self, endpoint: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|model| {
            model.inputs.iter().chain(&model.outputs).any(|e| e.name == endpoint)
                || model.rpc_server.as_deref().is_some_and(|service| {
                    endpoint == modelwire_comm::request_endpoint(service)
                        || endpoint == modelwire_comm::response_endpoint(service)
                })
        })
    }

    pub fn output(&self, name: &str) -> Option<(&ModelSpec, &EndpointSpec)> {
        self.models
            .iter()
            .find_map(|m| m.outputs.iter().find(|e| e.name == name).map(|e| (m, e)))
    }

    pub fn input(&self, name: &str) -> Option<(&ModelSpec, &EndpointSpec)> {
        self.models
            .iter()
            .find_map(|m| m.inputs.iter().find(|e| e.name == name).map(|e| (m, e)))
    }

    /// True if any endpoint or RPC pair needs the queue broker.
    pub fn uses_queues(&self) -> bool {
        self.models.iter().any(|m| {
            m.rpc_server.is_some()
                || !m.rpc_clients.is_empty()
                || m.inputs
                    .iter()
                    .chain(&m.outputs)
                    .any(|e| e.transport == TransportKind::Queue)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
run:
  grace_period_ms: 200
  log_dir: logs
models:
  - name: A
    language: shell
    args: [a.sh]
    outputs:
      - name: A_out
        format: json
        fields: [{name: out_val}]
  - name: B
    language: python
    args: [b.py, --fast]
    working_dir: /opt/b
    env: {MODE: test}
    inputs:
      - name: B_in
        format: table
        fields: [{name: in_val, units: kg/s}]
        row_format: "%g\n"
connections:
  - from: A_out
    to:
      - input: B_in
        transform: "%x% * 5"
      - file: {path: out/a.txt, filetype: table, field_names: [v]}
        transform: {function: identity}
"#;

    #[test]
    fn parses_yaml_description() {
        let graph = Graph::from_yaml_str(PIPELINE).unwrap();

        assert_eq!(graph.run.grace_period_ms, Some(200));
        assert_eq!(graph.models.len(), 2);
        let b = graph.model("B").unwrap();
        assert_eq!(b.language, Language::Python);
        assert_eq!(b.env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(b.inputs[0].transport, TransportKind::Queue);
        assert_eq!(b.inputs[0].fields[0].units.as_deref(), Some("kg/s"));

        let to = &graph.connections[0].to;
        assert_eq!(
            to[0].transform,
            Some(TransformSpec::Expression("%x% * 5".to_string()))
        );
        assert_eq!(
            to[1].transform,
            Some(TransformSpec::Function {
                function: "identity".to_string()
            })
        );
        assert_eq!(to[1].file.as_ref().unwrap().filetype, Format::Table);
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let mut graph = Graph::from_yaml_str(PIPELINE).unwrap();
        graph.resolve_paths(Path::new("/runs/demo"));

        assert_eq!(graph.run.log_dir, Some(PathBuf::from("/runs/demo/logs")));
        assert_eq!(
            graph.model("A").unwrap().working_dir,
            Some(PathBuf::from("/runs/demo"))
        );
        assert_eq!(
            graph.model("B").unwrap().working_dir,
            Some(PathBuf::from("/opt/b"))
        );
        let sink = graph.connections[0].to[1].file.as_ref().unwrap();
        assert_eq!(sink.path, PathBuf::from("/runs/demo/out/a.txt"));
    }

    #[test]
    fn json_descriptions_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"models": [{"name": "solo", "language": "executable", "args": ["/bin/true"]}]}"#,
        )
        .unwrap();

        let graph = Graph::from_path(&path).unwrap();
        assert_eq!(graph.models[0].language, Language::Executable);
        assert!(graph.models[0].working_dir.as_ref().unwrap().is_absolute());
        assert!(!graph.uses_queues());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Graph::from_yaml_str("models: []\nmodles: []\n").unwrap_err();
        assert!(err.to_string().contains("modles"));
    }

    #[test]
    fn owners_and_rpc_endpoints() {
        let graph = Graph::from_yaml_str(
            r#"
models:
  - {name: server, language: shell, args: [s.sh], rpc_server: solver}
  - {name: client, language: shell, args: [c.sh], rpc_clients: [solver]}
"#,
        )
        .unwrap();

        assert_eq!(graph.owner_of("solver.request").unwrap().name, "server");
        assert_eq!(
            graph.model("client").unwrap().endpoint_names(),
            vec!["solver.request", "solver.response"]
        );
        assert!(graph.uses_queues());
    }
}
