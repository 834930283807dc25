use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Last observed condition of a channel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy = 0,
    /// The transport is reachable but operations are being retried.
    Degraded = 1,
    /// The channel cannot carry further messages.
    Broken = 2,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Broken,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Broken => "broken",
        })
    }
}

/// Shareable view of a driver's health, polled by the orchestrator.
///
/// `Broken` is terminal: once set, later updates are ignored.
#[derive(Clone, Default)]
pub struct HealthProbe {
    state: Arc<AtomicU8>,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Health {
        Health::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, health: Health) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != Health::Broken as u8).then_some(health as u8)
            });
    }

    pub fn mark_broken(&self) {
        self.state.store(Health::Broken as u8, Ordering::Release);
    }

    pub fn is_broken(&self) -> bool {
        self.get() == Health::Broken
    }
}

impl fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HealthProbe").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        assert_eq!(HealthProbe::new().get(), Health::Healthy);
    }

    #[test]
    fn clones_share_state() {
        let probe = HealthProbe::new();
        let observer = probe.clone();

        probe.set(Health::Degraded);
        assert_eq!(observer.get(), Health::Degraded);
        probe.set(Health::Healthy);
        assert_eq!(observer.get(), Health::Healthy);
    }

    #[test]
    fn broken_is_sticky() {
        let probe = HealthProbe::new();
        probe.mark_broken();
        probe.set(Health::Healthy);
        assert!(probe.is_broken());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(Health::Degraded.to_string(), "degraded");
    }
}
