use tracing::info;

use crate::address::{endpoint_env_var, Address};
use crate::driver::{CommDriver, Direction, DriverConfig};
use crate::error::{CommError, Result};
use crate::file::FileDriver;
use crate::pipe;
use crate::queue::QueueDriver;

/// Open a driver for `address` in the given direction.
pub fn open(
    name: &str,
    address: &Address,
    direction: Direction,
    config: &DriverConfig,
) -> Result<Box<dyn CommDriver>> {
    let driver: Box<dyn CommDriver> = match address {
        Address::Queue { socket, queue } => Box::new(QueueDriver::connect(
            name, socket, queue, direction, config,
        )?),
        Address::File(path) => match direction {
            Direction::Output => Box::new(FileDriver::create(name, path, config)?),
            Direction::Input => Box::new(FileDriver::open(name, path, config)),
        },
        Address::Pipe(pipe_name) => {
            Box::new(pipe::open_named(name, pipe_name, direction, config)?)
        }
    };
    Ok(driver)
}

/// Address injected for `endpoint` into this process's environment.
pub fn address_from_env(endpoint: &str) -> Result<Address> {
    let var = endpoint_env_var(endpoint);
    let value = std::env::var(&var).map_err(|_| CommError::MissingEndpoint {
        name: endpoint.to_string(),
        var: var.clone(),
    })?;
    value.parse()
}

/// Open the model-side driver of an input endpoint declared in the graph.
pub fn open_input(endpoint: &str) -> Result<Box<dyn CommDriver>> {
    open_from_env(endpoint, Direction::Input)
}

/// Open the model-side driver of an output endpoint declared in the graph.
pub fn open_output(endpoint: &str) -> Result<Box<dyn CommDriver>> {
    open_from_env(endpoint, Direction::Output)
}

fn open_from_env(endpoint: &str, direction: Direction) -> Result<Box<dyn CommDriver>> {
    let address = address_from_env(endpoint)?;
    info!(endpoint, %address, %direction, "opening endpoint");
    open(endpoint, &address, direction, &DriverConfig::from_env())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use modelwire_frame::Received;

    use super::*;
    use crate::broker::Broker;
    use crate::driver::TransportKind;

    #[test]
    fn opens_each_transport_kind() {
        let dir = tempfile::tempdir().unwrap();
        let _broker = Broker::start(dir.path().join("b.sock")).unwrap();
        let config = DriverConfig::default();

        let cases = [
            format!("queue:{}#conn", dir.path().join("b.sock").display()),
            format!("file:{}", dir.path().join("conn.mwf").display()),
            "pipe:connector-test".to_string(),
        ];
        for text in cases {
            let address: Address = text.parse().unwrap();
            let mut output = open("o", &address, Direction::Output, &config).unwrap();
            let mut input = open("i", &address, Direction::Input, &config).unwrap();
            assert_eq!(output.kind(), address.kind());

            output.send(b"ping").unwrap();
            output.close().unwrap();
            assert_eq!(
                input.recv(Some(std::time::Duration::from_secs(5))).unwrap(),
                Received::Message(Bytes::from_static(b"ping")),
                "{text}"
            );
        }
        assert_eq!(TransportKind::default(), TransportKind::Queue);
    }

    #[test]
    fn missing_env_names_the_variable() {
        let err = address_from_env("definitely_not_injected").unwrap_err();
        match err {
            CommError::MissingEndpoint { var, .. } => {
                assert_eq!(var, "MODELWIRE_EP_DEFINITELY_NOT_INJECTED")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
