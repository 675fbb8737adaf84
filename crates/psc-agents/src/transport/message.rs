//! Protocol messages.
//!
//! One enum covers both directions. Child-to-parent messages carry the
//! sender's tag; parent-to-child messages do not need to, since a child has
//! exactly one parent.

use serde::{Deserialize, Serialize};

use psc_core::{CallTreeNode, IdMap, Property, SerializedStrategy, Tag};

/// Origin of a heartbeat as seen by its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    /// Sent by the child itself.
    Own,
    /// Relayed from further down the tree (fast mode).
    Forwarded,
    /// The sender leaves the tree (fast mode).
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    // child -> parent
    Heartbeat {
        hostname: String,
        port: u16,
        tag: Tag,
        heartbeat: HeartbeatKind,
        num_procs: u32,
    },
    FoundProp {
        property: Property,
    },
    CallTree {
        node: CallTreeNode,
    },
    CallTreeSent {
        tag: Tag,
    },
    SearchFinished {
        tag: Tag,
    },
    NeedRestart {
        tag: Tag,
    },
    ReqExperiment {
        tag: Tag,
    },
    Terminated {
        tag: Tag,
    },
    PropertiesSent {
        tag: Tag,
    },

    // parent -> child
    Start {
        strategy: SerializedStrategy,
    },
    StartExperiment,
    Check,
    Reinit {
        map: IdMap,
    },
    Terminate,
    Quit,
    SerializeCallTree,
}

impl Message {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::FoundProp { .. } => "foundprop",
            Message::CallTree { .. } => "calltree",
            Message::CallTreeSent { .. } => "calltreesent",
            Message::SearchFinished { .. } => "searchfinished",
            Message::NeedRestart { .. } => "needrestart",
            Message::ReqExperiment { .. } => "reqexperiment",
            Message::Terminated { .. } => "terminated",
            Message::PropertiesSent { .. } => "propertiessent",
            Message::Start { .. } => "start",
            Message::StartExperiment => "startexperiment",
            Message::Check => "check",
            Message::Reinit { .. } => "reinit",
            Message::Terminate => "terminate",
            Message::Quit => "quit",
            Message::SerializeCallTree => "serializecalltree",
        }
    }
}

/// What goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender tag; `None` from the frontend before it has registered.
    #[serde(default)]
    pub from: Option<Tag>,
    pub message: Message,
}

/// Acknowledgement returned for every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_tagged_by_kind() {
        let env = Envelope {
            from: Some(Tag::parse("fe[1]:0").unwrap()),
            message: Message::Heartbeat {
                hostname: "node1".into(),
                port: 30001,
                tag: Tag::parse("fe[1]:0").unwrap(),
                heartbeat: HeartbeatKind::Own,
                num_procs: 4,
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["message"]["kind"], "heartbeat");
        assert_eq!(json["message"]["heartbeat"], "own");
        assert_eq!(json["message"]["num_procs"], 4);

        let unit = serde_json::to_value(Message::StartExperiment).unwrap();
        assert_eq!(unit, serde_json::json!({"kind": "start_experiment"}));
    }

    #[test]
    fn missing_sender_defaults_to_none() {
        let env: Envelope =
            serde_json::from_str(r#"{"message":{"kind":"check"}}"#).unwrap();
        assert_eq!(env.from, None);
        assert_eq!(env.message, Message::Check);
    }
}
