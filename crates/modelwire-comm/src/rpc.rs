use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use modelwire_frame::Received;
use tracing::{debug, warn};

use crate::connector::{open_input, open_output};
use crate::driver::{env_millis, CommDriver};
use crate::error::{CommError, Result};
use crate::health::{Health, HealthProbe};

/// RPC timeout override injected into model processes.
pub const RPC_TIMEOUT_ENV: &str = "MODELWIRE_RPC_TIMEOUT_MS";
/// RPC retry override injected into model processes.
pub const RPC_RETRIES_ENV: &str = "MODELWIRE_RPC_RETRIES";

/// Endpoint carrying requests to `service`.
pub fn request_endpoint(service: &str) -> String {
    format!("{service}.request")
}

/// Endpoint carrying responses from `service`.
pub fn response_endpoint(service: &str) -> String {
    format!("{service}.response")
}

/// Client-side RPC settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long one wait for a response lasts.
    pub timeout: Duration,
    /// Extra waits before a call gives up.
    pub retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
        }
    }
}

impl RpcConfig {
    /// Defaults, with overrides taken from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_millis(RPC_TIMEOUT_ENV) {
            config.timeout = timeout;
        }
        if let Some(retries) = std::env::var(RPC_RETRIES_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            config.retries = retries;
        }
        config
    }
}

struct ClientChannels {
    request: Box<dyn CommDriver>,
    response: Box<dyn CommDriver>,
}

/// Calling side of an RPC channel pair.
///
/// One request is in flight at a time; concurrent callers queue on an
/// internal lock, so each response pairs with the request before it.
pub struct RpcClient {
    service: String,
    channels: Mutex<ClientChannels>,
    health: HealthProbe,
    config: RpcConfig,
}

impl RpcClient {
    pub fn new(
        service: &str,
        request: Box<dyn CommDriver>,
        response: Box<dyn CommDriver>,
        config: RpcConfig,
    ) -> Self {
        Self {
            service: service.to_string(),
            channels: Mutex::new(ClientChannels { request, response }),
            health: HealthProbe::new(),
            config,
        }
    }

    /// Open the client side of `service` from injected endpoint addresses.
    pub fn connect(service: &str) -> Result<Self> {
        let request = open_output(&request_endpoint(service))?;
        let response = open_input(&response_endpoint(service))?;
        Ok(Self::new(service, request, response, RpcConfig::from_env()))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn health(&self) -> HealthProbe {
        self.health.clone()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Send `request` and wait for the response with the configured timeout.
    pub fn call(&self, request: &[u8]) -> Result<Bytes> {
        self.call_with_timeout(request, self.config.timeout)
    }

    /// Send `request` and wait up to `timeout` per attempt for the response.
    ///
    /// Only the wait is retried; the request is sent once. When every wait
    /// times out the pair is marked broken and later calls fail at once.
    pub fn call_with_timeout(&self, request: &[u8], timeout: Duration) -> Result<Bytes> {
        let mut channels = self.lock()?;
        if self.health.is_broken() {
            return Err(CommError::Broken(format!(
                "rpc pair for '{}' is broken",
                self.service
            )));
        }

        channels.request.send(request).inspect_err(|_| {
            self.health.mark_broken();
        })?;

        for attempt in 0..=self.config.retries {
            match channels.response.recv(Some(timeout)) {
                Ok(Received::Message(response)) => {
                    self.health.set(Health::Healthy);
                    return Ok(response);
                }
                Ok(Received::Eof) => {
                    self.health.mark_broken();
                    return Err(CommError::Broken(format!(
                        "service '{}' closed its responses",
                        self.service
                    )));
                }
                Ok(Received::Timeout) => {
                    self.health.set(Health::Degraded);
                    debug!(service = %self.service, attempt, "rpc response wait timed out");
                }
                Err(err) => {
                    self.health.mark_broken();
                    return Err(err);
                }
            }
        }

        self.health.mark_broken();
        let waited = timeout * (self.config.retries + 1);
        warn!(service = %self.service, ?waited, "rpc call timed out");
        Err(CommError::RpcTimeout(waited))
    }

    /// Signal EOF to the server and release both channels.
    pub fn close(&self) -> Result<()> {
        let mut channels = self.lock()?;
        let sent = channels.request.close();
        channels.response.close()?;
        sent
    }

    fn lock(&self) -> Result<MutexGuard<'_, ClientChannels>> {
        self.channels
            .lock()
            .map_err(|_| CommError::Broken(format!("rpc client '{}' poisoned", self.service)))
    }
}

/// Serving side of an RPC channel pair.
pub struct RpcServer {
    service: String,
    request: Box<dyn CommDriver>,
    response: Box<dyn CommDriver>,
}

impl RpcServer {
    pub fn new(service: &str, request: Box<dyn CommDriver>, response: Box<dyn CommDriver>) -> Self {
        Self {
            service: service.to_string(),
            request,
            response,
        }
    }

    /// Open the server side of `service` from injected endpoint addresses.
    pub fn connect(service: &str) -> Result<Self> {
        let request = open_input(&request_endpoint(service))?;
        let response = open_output(&response_endpoint(service))?;
        Ok(Self::new(service, request, response))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wait for the next request.
    pub fn recv_request(&mut self, timeout: Option<Duration>) -> Result<Received> {
        self.request.recv(timeout)
    }

    /// Answer the request received last.
    pub fn send_response(&mut self, payload: &[u8]) -> Result<()> {
        self.response.send(payload)
    }

    /// Answer requests with `handler` until the client sends EOF.
    ///
    /// Returns the number of requests served. EOF is passed on to the
    /// response channel before returning.
    pub fn serve<F>(&mut self, mut handler: F) -> Result<u64>
    where
        F: FnMut(Bytes) -> Vec<u8>,
    {
        let mut served = 0u64;
        loop {
            match self.request.recv(None)? {
                Received::Message(request) => {
                    let response = handler(request);
                    self.response.send(&response)?;
                    served += 1;
                }
                Received::Eof => break,
                Received::Timeout => continue,
            }
        }
        debug!(service = %self.service, served, "rpc client finished");
        self.response.send_eof()?;
        Ok(served)
    }

    pub fn close(&mut self) -> Result<()> {
        let sent = self.response.close();
        self.request.close()?;
        sent
    }
}
