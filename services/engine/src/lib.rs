//! Switchyard routing engine.
//!
//! Rule-based proxy routing core: inbound listeners hand connections to a
//! dispatcher, which routes them through ordered rules to proxy groups and
//! outbound nodes, dials with bounded retry, and relays bytes full-duplex.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod inbound;
pub mod persistence;
pub mod proxy;

pub use adapter::{AdapterError, AdapterRegistry, Destination, ProtocolAdapter};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ConfigError, EngineError, SelectError};
pub use events::EventBus;
pub use proxy::{
    ConnMetadata, DispatchError, Dispatcher, Listener, ListenerConfig, ProxyGroup, Router,
    RoutingDecision, Snapshot,
};
