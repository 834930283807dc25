use std::collections::{HashMap, HashSet};

use modelwire_comm::TransportKind;
use modelwire_router::{Format, FunctionRegistry};
use modelwire_schema::SchemaRegistry;

use crate::error::{OrchestratorError, Result};
use crate::graph::{file_component, Graph, ModelSpec};
use crate::launch::LaunchSpec;

/// Check `graph` against every graph rule.
///
/// All problems are collected so a user fixes them in one pass.
pub fn validate(graph: &Graph, functions: &FunctionRegistry) -> Result<()> {
    let issues = issues(graph, functions);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidGraph { issues })
    }
}

/// Every rule `graph` breaks, in declaration order.
pub fn issues(graph: &Graph, functions: &FunctionRegistry) -> Vec<String> {
    let mut issues = Vec::new();
    check_models(graph, &mut issues);
    check_connections(graph, functions, &mut issues);
    check_rpc(graph, &mut issues);
    issues
}

fn check_models(graph: &Graph, issues: &mut Vec<String>) {
    let mut models = HashSet::new();
    let mut endpoints: HashMap<String, &str> = HashMap::new();

    for model in &graph.models {
        if model.name.is_empty() {
            issues.push("a model has an empty name".to_string());
        } else if !models.insert(model.name.as_str()) {
            issues.push(format!("model '{}' is declared twice", model.name));
        }
        if let Err(err) = LaunchSpec::from_model(model) {
            issues.push(err.to_string());
        }

        for endpoint in model.inputs.iter().chain(&model.outputs) {
            if endpoint.name.is_empty() {
                issues.push(format!("model '{}' has an unnamed endpoint", model.name));
                continue;
            }
            if let Some(owner) = endpoints.insert(endpoint.name.clone(), &model.name) {
                issues.push(format!(
                    "endpoint '{}' of model '{}' is already declared by model '{owner}'",
                    endpoint.name, model.name
                ));
            }
            if endpoint.transport == TransportKind::Pipe {
                issues.push(format!(
                    "endpoint '{}' of model '{}': pipe transport only works inside one process",
                    endpoint.name, model.name
                ));
            }
            if let Err(err) = endpoint.layout() {
                issues.push(format!("endpoint '{}': {err}", endpoint.name));
            }
            if let Some(datatype) = &endpoint.datatype {
                if let Err(err) = SchemaRegistry::new().register_value(&endpoint.name, datatype) {
                    issues.push(err.to_string());
                }
            }
        }
    }

    for model in &graph.models {
        check_env_names(model, issues);
        for service in model.rpc_server.iter().chain(&model.rpc_clients) {
            for queue in [
                modelwire_comm::request_endpoint(service),
                modelwire_comm::response_endpoint(service),
            ] {
                if let Some(owner) = endpoints.get(&queue) {
                    issues.push(format!(
                        "endpoint '{queue}' of model '{owner}' clashes with RPC service '{service}'"
                    ));
                }
            }
        }
    }
}

/// Each endpoint and RPC queue of a model reaches it through one
/// environment variable, so two names must never sanitise to the same one.
fn check_env_names(model: &ModelSpec, issues: &mut Vec<String>) {
    let rpc_queues = model
        .rpc_server
        .iter()
        .chain(&model.rpc_clients)
        .flat_map(|service| {
            [
                modelwire_comm::request_endpoint(service),
                modelwire_comm::response_endpoint(service),
            ]
        });
    let names = model
        .inputs
        .iter()
        .chain(&model.outputs)
        .map(|endpoint| endpoint.name.clone())
        .filter(|name| !name.is_empty())
        .chain(rpc_queues);

    let mut vars: HashMap<String, String> = HashMap::new();
    for name in names {
        let var = modelwire_comm::endpoint_env_var(&name);
        match vars.get(&var) {
            Some(first) if *first != name => issues.push(format!(
                "model '{}': '{first}' and '{name}' would both be passed as {var}",
                model.name
            )),
            Some(_) => {}
            None => {
                vars.insert(var, name);
            }
        }
    }
}

fn check_connections(graph: &Graph, functions: &FunctionRegistry, issues: &mut Vec<String>) {
    let mut consumed = HashSet::new();
    let mut fed = HashSet::new();
    let mut files = HashSet::new();

    for (index, connection) in graph.connections.iter().enumerate() {
        let label = connection
            .source_name()
            .unwrap_or_else(|| format!("connection #{}", index + 1));

        let source_format = match (&connection.from, &connection.from_file) {
            (Some(endpoint), None) => match graph.output(endpoint) {
                Some((_, output)) => {
                    if !consumed.insert(endpoint.clone()) {
                        issues.push(format!("output '{endpoint}' is the source of two connections"));
                    }
                    Some(output.format)
                }
                None if graph.input(endpoint).is_some() => {
                    issues.push(format!("'{endpoint}' is an input and cannot feed a connection"));
                    None
                }
                None => {
                    issues.push(format!("connection source '{endpoint}' is not a declared output"));
                    None
                }
            },
            (None, Some(file)) => {
                if !files.insert(file.path.clone()) {
                    issues.push(format!("{} is used by two connections", file_component(file)));
                }
                if let Err(err) = file.layout() {
                    issues.push(format!("{label}: {err}"));
                }
                Some(file.filetype)
            }
            _ => {
                issues.push(format!(
                    "{label}: exactly one of 'from' and 'from_file' must be set"
                ));
                None
            }
        };

        if connection.to.is_empty() {
            issues.push(format!("{label}: connection has no destinations"));
        }

        let mut seen = HashSet::new();
        for destination in &connection.to {
            let Some(name) = destination.destination_name() else {
                issues.push(format!(
                    "{label}: each destination needs exactly one of 'input' and 'file'"
                ));
                continue;
            };
            if !seen.insert(name.clone()) {
                issues.push(format!("{label} feeds '{name}' twice"));
            }

            if let Some(input) = &destination.input {
                if graph.input(input).is_some() {
                    fed.insert(input.clone());
                } else {
                    issues.push(format!("{label}: destination '{input}' is not a declared input"));
                }
            }
            if let Some(file) = &destination.file {
                if !files.insert(file.path.clone()) {
                    issues.push(format!("{name} is used by two connections"));
                }
                if let Err(err) = file.layout() {
                    issues.push(format!("{name}: {err}"));
                }
            }

            if let Some(transform) = &destination.transform {
                if source_format == Some(Format::Raw) {
                    issues.push(format!(
                        "{label} -> {name}: transforms need a json or table source, not raw"
                    ));
                }
                if let Err(err) = transform.resolve(functions) {
                    issues.push(format!("{label} -> {name}: {err}"));
                }
            }
        }
    }

    for model in &graph.models {
        for output in &model.outputs {
            if !consumed.contains(&output.name) {
                issues.push(format!(
                    "output '{}' of model '{}' is not connected",
                    output.name, model.name
                ));
            }
        }
        for input in &model.inputs {
            if !fed.contains(&input.name) {
                issues.push(format!(
                    "input '{}' of model '{}' is never fed",
                    input.name, model.name
                ));
            }
        }
    }
}

fn check_rpc(graph: &Graph, issues: &mut Vec<String>) {
    let mut servers: HashMap<&str, &str> = HashMap::new();
    for model in &graph.models {
        if let Some(service) = model.rpc_server.as_deref() {
            if let Some(other) = servers.insert(service, &model.name) {
                issues.push(format!(
                    "RPC service '{service}' is served by both '{other}' and '{}'",
                    model.name
                ));
            }
        }
    }

    let mut clients: HashMap<&str, &str> = HashMap::new();
    for model in &graph.models {
        for service in &model.rpc_clients {
            match servers.get(service.as_str()) {
                None => issues.push(format!(
                    "model '{}' calls RPC service '{service}', which no model serves",
                    model.name
                )),
                Some(server) if *server == model.name => issues.push(format!(
                    "model '{}' cannot call its own RPC service '{service}'",
                    model.name
                )),
                Some(_) => {}
            }
            if let Some(other) = clients.insert(service, &model.name) {
                issues.push(format!(
                    "RPC service '{service}' already has client '{other}', '{}' cannot join",
                    model.name
                ));
            }
        }
    }
}
