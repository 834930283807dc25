//! Endpoint allocation and router construction for one run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use modelwire_comm::{
    connector, endpoint_env_var, request_endpoint, response_endpoint, Address, Broker, Direction,
    QueueRole, TransportKind,
};
use modelwire_router::{
    FileSink, FileSource, FunctionRegistry, Router, RouterHandle, Sink, SourceInput,
};
use modelwire_schema::SchemaRegistry;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::error::{OrchestratorError, Result};
use crate::graph::{file_component, EndpointSpec, Graph};

const BROKER_SOCKET: &str = "broker.sock";

/// Channels and services shared by every model of a run.
pub(crate) struct Wiring {
    pub broker: Option<Broker>,
    pub router: Option<RouterHandle>,
    /// Endpoint variables injected into each model, by model name.
    pub env: HashMap<String, Vec<(String, String)>>,
    /// Queue registrations each model makes once connected.
    pub registrations: HashMap<String, Vec<(String, QueueRole)>>,
}

impl Wiring {
    /// True once `model` has registered on every queue it binds.
    pub fn is_connected(&self, model: &str) -> bool {
        let Some(broker) = &self.broker else {
            return true;
        };
        self.registrations
            .get(model)
            .is_none_or(|queues| queues.iter().all(|(q, role)| broker.is_registered(q, *role)))
    }
}

/// Start the broker, open the router side of every endpoint and start
/// routing.
pub(crate) fn wire(
    graph: &Graph,
    config: &RunConfig,
    functions: &FunctionRegistry,
    run_dir: &Path,
) -> Result<Wiring> {
    let broker = if graph.uses_queues() {
        Some(Broker::start(run_dir.join(BROKER_SOCKET))?)
    } else {
        None
    };
    let socket = broker.as_ref().map(|b| b.path().to_path_buf());
    let driver_config = config.driver_config();

    let mut env: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let mut registrations: HashMap<String, Vec<(String, QueueRole)>> = HashMap::new();
    let mut sources = HashMap::new();
    let mut sinks = HashMap::new();
    let mut schemas = SchemaRegistry::new();

    for model in &graph.models {
        let model_env = env.entry(model.name.clone()).or_default();
        let model_queues = registrations.entry(model.name.clone()).or_default();

        for (endpoint, role) in model
            .outputs
            .iter()
            .map(|e| (e, QueueRole::Producer))
            .chain(model.inputs.iter().map(|e| (e, QueueRole::Consumer)))
        {
            let address = allocate(endpoint, socket.as_deref(), run_dir)?;
            model_env.push((endpoint_env_var(&endpoint.name), address.to_string()));
            if endpoint.transport == TransportKind::Queue {
                model_queues.push((endpoint.name.clone(), role));
            }

            let layout = endpoint.layout()?;
            match role {
                QueueRole::Producer => {
                    let driver =
                        connector::open(&endpoint.name, &address, Direction::Input, &driver_config)?;
                    sources.insert(endpoint.name.clone(), (layout, SourceInput::Channel(driver)));
                }
                QueueRole::Consumer => {
                    let driver =
                        connector::open(&endpoint.name, &address, Direction::Output, &driver_config)?;
                    sinks.insert(endpoint.name.clone(), (layout, Sink::Channel(driver)));
                    if let Some(datatype) = &endpoint.datatype {
                        schemas.register_value(&endpoint.name, datatype)?;
                    }
                }
            }
            debug!(model = %model.name, endpoint = %endpoint.name, %address, "endpoint allocated");
        }

        let rpc_roles = model
            .rpc_server
            .iter()
            .map(|s| (s, QueueRole::Consumer, QueueRole::Producer))
            .chain(
                model
                    .rpc_clients
                    .iter()
                    .map(|s| (s, QueueRole::Producer, QueueRole::Consumer)),
            );
        for (service, request_role, response_role) in rpc_roles {
            let socket = socket.clone().ok_or_else(|| {
                OrchestratorError::Configuration("RPC needs the queue broker".to_string())
            })?;
            for (queue, role) in [
                (request_endpoint(service), request_role),
                (response_endpoint(service), response_role),
            ] {
                let address = Address::Queue {
                    socket: socket.clone(),
                    queue: queue.clone(),
                };
                model_env.push((endpoint_env_var(&queue), address.to_string()));
                model_queues.push((queue, role));
            }
        }
    }

    let mut builder = Router::builder()
        .functions(functions.clone())
        .schemas(schemas);
    for connection in &graph.connections {
        let Some(source) = connection.source_name() else {
            continue;
        };
        match &connection.from_file {
            Some(file) => {
                let input = FileSource::from_spec(file)?;
                builder = builder.source(source.clone(), file.layout()?, SourceInput::File(input));
            }
            None => {
                if let Some((layout, input)) = sources.remove(&source) {
                    builder = builder.source(source.clone(), layout, input);
                }
            }
        }

        for destination in &connection.to {
            let Some(name) = destination.destination_name() else {
                continue;
            };
            if let Some(file) = &destination.file {
                builder = builder.destination(
                    file_component(file),
                    file.layout()?,
                    Sink::File(FileSink::from_spec(file)?),
                );
            } else if let Some((layout, sink)) = sinks.remove(&name) {
                builder = builder.destination(name.clone(), layout, sink);
            }
            builder = builder.edge(source.clone(), name, destination.transform.clone());
        }
    }

    let router = if graph.connections.is_empty() {
        None
    } else {
        Some(builder.build()?.start()?)
    };
    info!(
        broker = ?broker.as_ref().map(Broker::path),
        routed = graph.connections.len(),
        "graph wired"
    );

    Ok(Wiring {
        broker,
        router,
        env,
        registrations,
    })
}

fn allocate(endpoint: &EndpointSpec, socket: Option<&Path>, run_dir: &Path) -> Result<Address> {
    match endpoint.transport {
        TransportKind::Queue => {
            let socket = socket.ok_or_else(|| {
                OrchestratorError::Configuration("queue endpoints need the broker".to_string())
            })?;
            Ok(Address::Queue {
                socket: socket.to_path_buf(),
                queue: endpoint.name.clone(),
            })
        }
        TransportKind::File => Ok(Address::File(frames_path(run_dir, &endpoint.name))),
        TransportKind::Pipe => Err(OrchestratorError::Configuration(format!(
            "endpoint '{}' cannot use pipe transport between processes",
            endpoint.name
        ))),
    }
}

fn frames_path(run_dir: &Path, endpoint: &str) -> PathBuf {
    let file: String = endpoint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    run_dir.join(format!("{file}.frames"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use modelwire_comm::{open, CommDriver, DriverConfig, Received};

    use super::*;

    fn graph() -> Graph {
        Graph::from_yaml_str(
            r#"
models:
  - name: A
    language: shell
    args: [a.sh]
    outputs: [{name: A_out, format: json, fields: [{name: x}]}]
  - name: B
    language: shell
    args: [b.sh]
    inputs: [{name: B_in, format: json, transport: file}]
    rpc_server: svc
  - name: C
    language: shell
    args: [c.sh]
    rpc_clients: [svc]
connections:
  - from: A_out
    to: [{input: B_in, transform: "%x% * 5"}]
"#,
        )
        .unwrap()
    }

    fn address(wiring: &Wiring, model: &str, var: &str) -> Address {
        wiring.env[model]
            .iter()
            .find(|(k, _)| k == var)
            .map(|(_, v)| v.parse().unwrap())
            .unwrap()
    }

    #[test]
    fn routes_between_allocated_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut wiring = wire(
            &graph(),
            &RunConfig::default(),
            &FunctionRegistry::new(),
            dir.path(),
        )
        .unwrap();

        let a_out = address(&wiring, "A", "MODELWIRE_EP_A_OUT");
        let b_in = address(&wiring, "B", "MODELWIRE_EP_B_IN");
        assert_eq!(a_out.kind(), TransportKind::Queue);
        assert_eq!(b_in, Address::File(dir.path().join("B_in.frames")));

        let config = DriverConfig::default();
        let mut producer = open("A_out", &a_out, Direction::Output, &config).unwrap();
        let mut consumer = open("B_in", &b_in, Direction::Input, &config).unwrap();
        producer.send(br#"{"x": 10}"#).unwrap();
        producer.close().unwrap();

        assert_eq!(
            consumer.recv(Some(Duration::from_secs(5))).unwrap(),
            Received::Message(Bytes::from_static(br#"{"x":50}"#))
        );
        assert_eq!(
            consumer.recv(Some(Duration::from_secs(5))).unwrap(),
            Received::Eof
        );
        assert!(wiring.is_connected("A"));

        if let Some(mut router) = wiring.router.take() {
            router.close();
        }
    }

    #[test]
    fn rpc_queues_are_injected_on_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let wiring = wire(
            &graph(),
            &RunConfig::default(),
            &FunctionRegistry::new(),
            dir.path(),
        )
        .unwrap();

        let server = address(&wiring, "B", "MODELWIRE_EP_SVC_REQUEST");
        let client = address(&wiring, "C", "MODELWIRE_EP_SVC_REQUEST");
        assert_eq!(server, client);
        assert_eq!(
            wiring.registrations["C"],
            vec![
                ("svc.request".to_string(), QueueRole::Producer),
                ("svc.response".to_string(), QueueRole::Consumer),
            ]
        );
        assert!(!wiring.is_connected("C"));
        assert!(!wiring.is_connected("A"));
    }

    #[test]
    fn frames_paths_are_file_safe() {
        assert_eq!(
            frames_path(Path::new("/run"), "a/b c"),
            PathBuf::from("/run/a_b_c.frames")
        );
    }
}
