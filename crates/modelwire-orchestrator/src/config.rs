use std::path::PathBuf;
use std::time::Duration;

use modelwire_comm::{DriverConfig, RecvPolicy, RpcConfig};

use crate::graph::RunSection;

/// Settings of one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// How often process liveness and channel health are checked.
    pub poll_interval: Duration,
    /// How long a model may stay in `Starting`.
    pub startup_timeout: Duration,
    /// How long models get to exit after `SIGTERM` before being killed.
    pub grace_period: Duration,
    /// Receive policy handed to models.
    pub recv: RecvPolicy,
    /// RPC settings handed to models.
    pub rpc: RpcConfig,
    pub reassembly_timeout: Duration,
    /// Where model stdout/stderr are captured. Inherited when unset.
    pub log_dir: Option<PathBuf>,
    /// Where the broker socket and file channels live. A temporary
    /// directory, removed after the run, when unset.
    pub run_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            startup_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            recv: RecvPolicy::default(),
            rpc: RpcConfig::default(),
            reassembly_timeout: Duration::from_secs(5),
            log_dir: None,
            run_dir: None,
        }
    }
}

impl RunConfig {
    /// Overlay the graph's `run:` section.
    pub fn apply(&mut self, run: &RunSection) {
        let ms = Duration::from_millis;
        if let Some(v) = run.poll_interval_ms {
            self.poll_interval = ms(v.max(1));
        }
        if let Some(v) = run.startup_timeout_ms {
            self.startup_timeout = ms(v);
        }
        if let Some(v) = run.grace_period_ms {
            self.grace_period = ms(v);
        }
        if let Some(v) = run.recv_timeout_ms {
            self.recv.timeout = Some(ms(v));
        }
        if let Some(v) = run.recv_retries {
            self.recv.retries = v;
        }
        if let Some(v) = run.rpc_timeout_ms {
            self.rpc.timeout = ms(v);
        }
        if let Some(v) = run.rpc_retries {
            self.rpc.retries = v;
        }
        if let Some(v) = run.reassembly_timeout_ms {
            self.reassembly_timeout = ms(v);
        }
        if let Some(dir) = &run.log_dir {
            self.log_dir = Some(dir.clone());
        }
    }

    pub fn from_section(run: &RunSection) -> Self {
        let mut config = Self::default();
        config.apply(run);
        config
    }

    /// Settings for the router's own drivers.
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            reassembly_timeout: self.reassembly_timeout,
            ..DriverConfig::default()
        }
    }

    /// Variables every model process receives besides its endpoints.
    pub fn model_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (
                modelwire_comm::RPC_TIMEOUT_ENV,
                self.rpc.timeout.as_millis().to_string(),
            ),
            (modelwire_comm::RPC_RETRIES_ENV, self.rpc.retries.to_string()),
            (
                modelwire_comm::REASSEMBLY_TIMEOUT_ENV,
                self.reassembly_timeout.as_millis().to_string(),
            ),
        ];
        if let Some(timeout) = self.recv.timeout {
            env.push((
                modelwire_comm::RECV_TIMEOUT_ENV,
                timeout.as_millis().to_string(),
            ));
            env.push((modelwire_comm::RECV_RETRIES_ENV, self.recv.retries.to_string()));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_section_overrides_defaults() {
        let config = RunConfig::from_section(&RunSection {
            grace_period_ms: Some(250),
            recv_timeout_ms: Some(100),
            recv_retries: Some(3),
            rpc_retries: Some(0),
            log_dir: Some(PathBuf::from("/tmp/logs")),
            ..RunSection::default()
        });

        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.recv.timeout, Some(Duration::from_millis(100)));
        assert_eq!(config.rpc.retries, 0);
        assert_eq!(config.rpc.timeout, Duration::from_secs(5));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn model_env_carries_timeouts() {
        let mut config = RunConfig::default();
        let names: Vec<&str> = config.model_env().iter().map(|(k, _)| *k).collect();
        assert!(!names.contains(&modelwire_comm::RECV_TIMEOUT_ENV));

        config.recv.timeout = Some(Duration::from_millis(40));
        let env = config.model_env();
        assert!(env.contains(&(modelwire_comm::RECV_TIMEOUT_ENV, "40".to_string())));
        assert!(env.contains(&(modelwire_comm::RPC_TIMEOUT_ENV, "5000".to_string())));
    }
}
