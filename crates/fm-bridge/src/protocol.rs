use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Pub,
    Sub,
    Unsub,
}

impl Method {
    /// RPC methods expect a correlated response; PUB/SUB/UNSUB do not.
    pub fn is_rpc(&self) -> bool {
        matches!(self, Method::Get | Method::Post | Method::Put | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Pub => "PUB",
            Method::Sub => "SUB",
            Method::Unsub => "UNSUB",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Upstream,
    Transport,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Conflict, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Unauthorized, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Upstream, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Internal, message)
    }
}

// ---------------------------------------------------------------------------
// Frame — the single wire message shape
// ---------------------------------------------------------------------------

/// One JSON frame on the persistent connection.
///
/// Requests carry `method` + `path` (and `id` when a response is expected);
/// responses echo the `id` with either `data` or `error`; event deliveries
/// are PUB frames whose `path` is the topic. `params` is filled server-side
/// from `:param` path segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Frame {
    /// A correlated RPC request.
    pub fn request(method: Method, path: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            method: Some(method),
            path: path.into(),
            data,
            ..Default::default()
        }
    }

    /// An event delivery (or client-originated publish) on a topic.
    pub fn publish(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            method: Some(Method::Pub),
            path: topic.into(),
            data: payload,
            ..Default::default()
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            method: Some(Method::Sub),
            path: topic.into(),
            ..Default::default()
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            method: Some(Method::Unsub),
            path: topic.into(),
            ..Default::default()
        }
    }

    /// A successful response to the request carrying `id`.
    pub fn response(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            data,
            ..Default::default()
        }
    }

    /// An error response to the request carrying `id`.
    pub fn error_response(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error),
            ..Default::default()
        }
    }

    /// True for frames that answer a request (no method, an id present).
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Topics and event names
// ---------------------------------------------------------------------------

pub mod topics {
    pub const TICKETS: &str = "/tickets";
    pub const AGENTS: &str = "/agents";
    pub const AGENTS_STATE: &str = "/agents/state";
    pub const CI: &str = "/ci";

    pub fn agent_tasks(agent_id: &str) -> String {
        format!("/agents/{}/tasks", agent_id)
    }

    pub fn agent_stop(agent_id: &str) -> String {
        format!("/agents/{}/stop", agent_id)
    }

    /// When `topic` is an agent task channel, return the agent id.
    pub fn parse_agent_tasks(topic: &str) -> Option<&str> {
        let rest = topic.strip_prefix("/agents/")?;
        rest.strip_suffix("/tasks")
    }
}

pub mod events {
    pub const TICKET_CREATED: &str = "ticket:created";
    pub const TICKET_UPDATED: &str = "ticket:updated";
    pub const TICKET_DELETED: &str = "ticket:deleted";
    pub const TICKET_APPROVED: &str = "ticket:approved";
    pub const COMMENT_CREATED: &str = "comment:created";
    pub const COMMENT_UPDATED: &str = "comment:updated";
    pub const COMMENT_COMPLETED: &str = "comment:completed";
    pub const AGENT_CREATED: &str = "agent:created";
    pub const AGENT_UPDATED: &str = "agent:updated";
    pub const AGENT_DELETED: &str = "agent:deleted";
    pub const AGENT_STATUS: &str = "agent:status";
    pub const AGENT_ERROR: &str = "agent:error";
    pub const CI_RUN_STARTED: &str = "ci:run_started";
}

/// Envelope published on domain topics: an event name plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// Push delivered on `/agents/{id}/tasks` after a task is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPush {
    pub task_id: String,
    pub task_type: fm_core::types::TaskType,
    pub task_data: Value,
}

/// Explicit status report published by workers on `/agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub agent_id: String,
    pub activity: fm_core::types::AgentActivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
