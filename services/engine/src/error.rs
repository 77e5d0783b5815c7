//! Error types shared across the engine.

use std::path::PathBuf;

use switchyard_networking::NetworkError;
use thiserror::Error;

/// A configuration that cannot be loaded. Reported by `reload` before any
/// state is swapped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("group name {0:?} collides with an existing node or group")]
    NameCollision(String),

    #[error("group {0:?} has no members")]
    EmptyGroup(String),

    #[error("group {group:?} references unknown node {member:?}")]
    UnknownMember { group: String, member: String },

    #[error("rule {rule:?} targets unknown group or node {target:?}")]
    UnknownTarget { rule: String, target: String },

    #[error("node {node:?} uses unknown protocol kind {kind:?}")]
    UnknownProtocol { node: String, kind: String },

    #[error("invalid node {node:?}: {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("malformed rule {rule:?}: {reason}")]
    MalformedRule { rule: String, reason: String },

    #[error("group {group:?} has an invalid probe url {url:?}")]
    InvalidProbeUrl { group: String, url: String },

    #[error("invalid inbound: {0}")]
    InvalidInbound(String),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Group selection failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// No member of the group is usable.
    #[error("no available node in group {group:?}")]
    NoAvailableNode { group: String },

    #[error("node {node:?} is not a member of group {group:?}")]
    UnknownNode { group: String, node: String },

    #[error("group {group:?} does not support manual selection")]
    NotSelectable { group: String },

    #[error("unknown group {0:?}")]
    UnknownGroup(String),
}

/// Runtime wrapper failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has not been set up")]
    NotStarted,

    #[error("config payload is empty")]
    EmptyConfig,

    #[error("config payload is not valid base64: {0}")]
    InvalidBase64(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{context} ({}): {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        EngineError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}
