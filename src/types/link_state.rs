use serde::{Deserialize, Serialize};

/// Lifecycle state of a connection's physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}
