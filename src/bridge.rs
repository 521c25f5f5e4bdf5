//! The external ML/RL bridge command set: **consumed, not implemented**.
//!
//! The WebSocket surface an external
//! reinforcement-learning process would speak against this engine (a
//! PettingZoo-style `reset`/`step`/`observe` API) is a named interface
//! only. This module defines the closed set of request/response types so a
//! future adapter crate has something stable to implement the actual
//! transport against; nothing here opens a socket or spawns a process.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ids::AgentId;

/// One command a bridge client may send: `reset`, `step`, `observe`, `last`,
/// `agent_selection`, `action_mask`, `rewards`, `terminations`,
/// `truncations`, `infos`, `env_info`, `observation_space`, `action_space`,
/// `render`, `close`, `ping`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum BridgeCommand {
    Reset {
        seed: Option<u64>,
    },
    Step {
        agent: AgentId,
        action: Json,
    },
    Observe {
        agent: AgentId,
    },
    Last,
    AgentSelection,
    ActionMask {
        agent: AgentId,
    },
    Rewards,
    Terminations,
    Truncations,
    Infos,
    EnvInfo,
    ObservationSpace {
        agent: AgentId,
    },
    ActionSpace {
        agent: AgentId,
    },
    Render,
    Close,
    Ping,
}

/// The response shape matching each [`BridgeCommand`] variant. An adapter
/// implementing the real transport maps `Engine`/`Chronicle` state into
/// these at the boundary; this crate only fixes their shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum BridgeResponse {
    Reset {
        observations: Json,
    },
    Step {
        observations: Json,
        rewards: Json,
        terminations: Json,
        truncations: Json,
        infos: Json,
    },
    Observe {
        observation: Json,
    },
    Last {
        observation: Json,
        reward: f64,
        termination: bool,
        truncation: bool,
        info: Json,
    },
    AgentSelection {
        agent: AgentId,
    },
    ActionMask {
        mask: Json,
    },
    Rewards {
        rewards: Json,
    },
    Terminations {
        terminations: Json,
    },
    Truncations {
        truncations: Json,
    },
    Infos {
        infos: Json,
    },
    EnvInfo {
        info: Json,
    },
    ObservationSpace {
        space: Json,
    },
    ActionSpace {
        space: Json,
    },
    Render {
        frame: Json,
    },
    Close,
    Pong,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_match_the_specified_closed_set() {
        let commands = [
            BridgeCommand::Reset { seed: Some(7) },
            BridgeCommand::Last,
            BridgeCommand::AgentSelection,
            BridgeCommand::Rewards,
            BridgeCommand::Terminations,
            BridgeCommand::Truncations,
            BridgeCommand::Infos,
            BridgeCommand::EnvInfo,
            BridgeCommand::Render,
            BridgeCommand::Close,
            BridgeCommand::Ping,
        ];
        for command in &commands {
            let json = serde_json::to_value(command).unwrap();
            assert!(json.get("cmd").is_some());
        }
    }

    #[test]
    fn step_command_round_trips_through_json() {
        let command = BridgeCommand::Step {
            agent: AgentId::from("p1"),
            action: Json::from(3),
        };
        let encoded = serde_json::to_string(&command).unwrap();
        let decoded: BridgeCommand = serde_json::from_str(&encoded).unwrap();
        match decoded {
            BridgeCommand::Step { agent, action } => {
                assert_eq!(agent, AgentId::from("p1"));
                assert_eq!(action, Json::from(3));
            }
            _ => panic!("expected Step"),
        }
    }

    #[test]
    fn response_error_variant_carries_a_message() {
        let response = BridgeResponse::Error {
            message: "unknown agent".into(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["cmd"], "error");
        assert_eq!(json["message"], "unknown agent");
    }
}
