use serde::{Deserialize, Serialize};

/// Broker control operation: join a queue.
pub const OP_REGISTER: &str = "register";
/// Broker control operation: leave a queue cleanly.
pub const OP_DEREGISTER: &str = "deregister";

/// Side of a queue a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueRole {
    Producer,
    Consumer,
}

/// Control-frame payload sent by drivers to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub op: String,
    pub queue: String,
    pub role: QueueRole,
}

impl Registration {
    pub fn register(queue: &str, role: QueueRole) -> Self {
        Self {
            op: OP_REGISTER.to_string(),
            queue: queue.to_string(),
            role,
        }
    }

    pub fn deregister(queue: &str, role: QueueRole) -> Self {
        Self {
            op: OP_DEREGISTER.to_string(),
            queue: queue.to_string(),
            role,
        }
    }
}

/// Broker reply to a [`Registration`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationAck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegistrationAck {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_wire_shape() {
        let reg = Registration::register("A_out", QueueRole::Producer);
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "register", "queue": "A_out", "role": "producer"})
        );
    }

    #[test]
    fn accepted_ack_omits_error() {
        let json = serde_json::to_string(&RegistrationAck::accepted()).unwrap();
        assert_eq!(json, r#"{"ok":true}"#);
    }
}
