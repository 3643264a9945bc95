//! Status types shared between the cluster engine and its consumers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a member as reported by the membership API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Leader,
    Follower,
    /// The member could not be probed.
    #[serde(rename = "unreachable")]
    Unreachable,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemberState::Leader => "Leader",
            MemberState::Follower => "Follower",
            MemberState::Unreachable => "unreachable",
        })
    }
}

/// Point-in-time, best-effort snapshot of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub id: String,
    pub endpoint: String,
    pub state: MemberState,
    pub number_of_keys: u64,
    pub hash: u32,
}

impl ServerStatus {
    /// Placeholder for a member whose probe failed or never ran.
    pub fn unreachable(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            id: "unknown".to_string(),
            endpoint: endpoint.to_string(),
            state: MemberState::Unreachable,
            number_of_keys: 0,
            hash: 0,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.state != MemberState::Unreachable
    }
}
