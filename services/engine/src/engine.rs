//! Runtime wrapper around the routing core.
//!
//! [`Engine`] owns everything that lives between `setup` and `stop`: the
//! router with its snapshot, one health checker per group, the inbound
//! listeners, and the persisted config. Every operation other than
//! `stop` fails with [`EngineError::NotStarted`] before `setup`.
//!
//! A reload validates the whole config before touching anything. When it
//! is rejected the previous snapshot keeps routing and a `config.rejected`
//! event is published. A reload that changes the inbound section binds the
//! new listeners before the snapshot is swapped. If binding fails, the
//! previous listeners, snapshot and health checkers stay in place.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use switchyard_events::{
    ConfigAppliedPayload, ConfigRejectedPayload, EngineStartedPayload, EventEnvelope, EventPayload,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapter::AdapterRegistry;
use crate::config::{EngineConfig, InboundConfig};
use crate::error::{ConfigError, EngineError};
use crate::events::EventBus;
use crate::inbound::{Inbound, MixedInbound, TunnelInbound};
use crate::persistence::{decode_base64, resolve_source, ConfigStore};
use crate::proxy::{Dispatcher, HealthChecker, Listener, ListenerConfig, Router, Snapshot};

/// Tag of the mixed SOCKS5 / HTTP listener.
pub const MIXED_TAG: &str = "mixed";

/// Proxy engine runtime.
#[derive(Debug)]
pub struct Engine {
    adapters: AdapterRegistry,
    events: EventBus,
    state: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    home: PathBuf,
    store: ConfigStore,
    router: Arc<Router>,
    config: EngineConfig,
    last_applied: Vec<u8>,
    listeners: ListenerSet,
    checkers: CheckerSet,
}

/// Running listeners and their shared shutdown signal.
#[derive(Debug)]
struct ListenerSet {
    shutdown: watch::Sender<bool>,
    listeners: Vec<Arc<Listener>>,
    handles: Vec<JoinHandle<()>>,
}

/// Running health checkers of one snapshot.
#[derive(Debug)]
struct CheckerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_adapters(AdapterRegistry::with_builtins())
    }

    /// Engine with a custom adapter registry.
    pub fn with_adapters(adapters: AdapterRegistry) -> Self {
        Self {
            adapters,
            events: EventBus::default(),
            state: Mutex::new(None),
        }
    }

    /// Start from `home_dir` and a config source (file path, base64 text or
    /// raw TOML). A running engine is stopped first.
    pub async fn setup(
        &self,
        home_dir: impl AsRef<Path>,
        config_source: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.take() {
            self.shutdown(running).await;
        }

        let home = prepare_home(home_dir.as_ref())?;
        let (bytes, kind) = resolve_source(&home, config_source)?;
        info!(home_dir = %home.display(), source = ?kind, "Setting up engine");

        let config = self.parse(&bytes)?;
        let inbounds = build_inbounds(&config.inbound).inspect_err(|e| self.rejected(e))?;
        let snapshot =
            Snapshot::build(&config, &self.adapters, None).inspect_err(|e| self.rejected(e))?;
        let router = Arc::new(Router::new(snapshot));

        let listeners = self.start_listeners(&config.inbound, inbounds, &router).await?;
        let checkers = self.start_checkers(&router);

        let store = ConfigStore::new(&home);
        if let Err(e) = store.save(&bytes) {
            warn!(error = %e, "Failed to persist config");
        }

        self.applied(&router);
        self.events.publish(EventPayload::EngineStarted(EngineStartedPayload {
            home_dir: home.display().to_string(),
            listeners: listeners.describe(),
        }));
        info!(
            home_dir = %home.display(),
            listeners = listeners.listeners.len(),
            "Engine started"
        );

        *state = Some(Running {
            home,
            store,
            router,
            config,
            last_applied: bytes,
            listeners,
            checkers,
        });
        Ok(())
    }

    /// Re-apply the last successfully applied config.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let running = state.as_mut().ok_or(EngineError::NotStarted)?;
        let bytes = running.last_applied.clone();
        self.apply(running, bytes).await
    }

    /// Apply new config bytes and persist them on success.
    pub async fn reload_with_config(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let running = state.as_mut().ok_or(EngineError::NotStarted)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(EngineError::EmptyConfig);
        }
        self.apply(running, bytes.to_vec()).await
    }

    /// Decode base64 text and apply it.
    pub async fn reload_with_base64(&self, text: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let running = state.as_mut().ok_or(EngineError::NotStarted)?;
        if text.trim().is_empty() {
            return Err(EngineError::EmptyConfig);
        }
        let bytes = decode_base64(text).ok_or_else(|| {
            EngineError::InvalidBase64("not valid base64 UTF-8 text".to_string())
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(EngineError::EmptyConfig);
        }
        self.apply(running, bytes).await
    }

    /// Stop listeners and health checkers. Established sessions finish on
    /// their own. Calling it again is a no-op.
    pub async fn stop(&self) {
        if let Some(running) = self.state.lock().await.take() {
            self.shutdown(running).await;
            self.events.publish(EventPayload::EngineStopped);
            info!("Engine stopped");
        }
    }

    /// Real-time event stream.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<EventEnvelope>, EngineError> {
        if self.state.lock().await.is_none() {
            return Err(EngineError::NotStarted);
        }
        Ok(self.events.subscribe())
    }

    /// Pin `node` in the select group `group`.
    pub async fn select_proxy(&self, group: &str, node: &str) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let running = state.as_ref().ok_or(EngineError::NotStarted)?;
        running.router.load().select_proxy(group, node)?;
        info!(group = %group, node = %node, "Manual selection changed");
        Ok(())
    }

    /// Bound listener addresses with their inbound tags.
    pub async fn local_addrs(&self) -> Result<Vec<(String, SocketAddr)>, EngineError> {
        let state = self.state.lock().await;
        let running = state.as_ref().ok_or(EngineError::NotStarted)?;
        Ok(running
            .listeners
            .listeners
            .iter()
            .filter_map(|l| Some((l.tag().to_string(), l.local_addr().ok()?)))
            .collect())
    }

    pub async fn router(&self) -> Result<Arc<Router>, EngineError> {
        let state = self.state.lock().await;
        let running = state.as_ref().ok_or(EngineError::NotStarted)?;
        Ok(Arc::clone(&running.router))
    }

    pub async fn home_dir(&self) -> Result<PathBuf, EngineError> {
        let state = self.state.lock().await;
        Ok(state.as_ref().ok_or(EngineError::NotStarted)?.home.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    async fn apply(&self, running: &mut Running, bytes: Vec<u8>) -> Result<(), EngineError> {
        let config = self.parse(&bytes)?;
        let inbounds = build_inbounds(&config.inbound).inspect_err(|e| self.rejected(e))?;
        let current = running.router.load();
        let next = Snapshot::build(&config, &self.adapters, Some(&current))
            .inspect_err(|e| self.rejected(e))?;

        if config.inbound != running.config.inbound {
            info!("Inbound settings changed, restarting listeners");
            self.replace_listeners(running, &config.inbound, inbounds).await?;
        }

        running.router.store(Arc::new(next));
        info!("Routing snapshot swapped");
        let checkers = self.start_checkers(&running.router);
        std::mem::replace(&mut running.checkers, checkers).stop().await;

        if let Err(e) = running.store.save(&bytes) {
            warn!(error = %e, "Failed to persist config");
        }
        running.config = config;
        running.last_applied = bytes;
        self.applied(&running.router);
        Ok(())
    }

    fn parse(&self, bytes: &[u8]) -> Result<EngineConfig, EngineError> {
        EngineConfig::from_bytes(bytes).map_err(|e| {
            self.rejected(&e);
            e.into()
        })
    }

    fn rejected(&self, error: &ConfigError) {
        warn!(error = %error, "Config rejected");
        self.events.publish(EventPayload::ConfigRejected(ConfigRejectedPayload {
            error: error.to_string(),
        }));
    }

    fn applied(&self, router: &Router) {
        let snapshot = router.load();
        self.events.publish(EventPayload::ConfigApplied(ConfigAppliedPayload {
            nodes: snapshot.registry().len(),
            groups: snapshot.groups().len(),
            rules: snapshot.table().len(),
        }));
    }

    fn start_checkers(&self, router: &Router) -> CheckerSet {
        let snapshot = router.load();
        let (shutdown, rx) = watch::channel(false);
        let handles = snapshot
            .groups()
            .iter()
            .map(|group| {
                HealthChecker::new(
                    Arc::clone(group),
                    Arc::clone(snapshot.registry()),
                    self.events.clone(),
                )
                .spawn(rx.clone())
            })
            .collect();
        CheckerSet { shutdown, handles }
    }

    async fn start_listeners(
        &self,
        inbound: &InboundConfig,
        inbounds: Vec<(SocketAddr, Arc<dyn Inbound>)>,
        router: &Arc<Router>,
    ) -> Result<ListenerSet, EngineError> {
        let mut set = ListenerSet::empty();
        let dispatcher = Dispatcher::new(Arc::clone(router), self.events.clone());

        for (addr, handler) in inbounds {
            let config = ListenerConfig {
                bind_addr: addr,
                max_connections: inbound.max_connections,
                handshake_timeout: inbound.handshake_timeout(),
            };
            let listener = match Listener::bind(config, handler, dispatcher.clone()).await {
                Ok(listener) => Arc::new(listener),
                Err(source) => {
                    error!(bind_addr = %addr, error = %source, "Failed to bind listener");
                    set.stop().await;
                    return Err(EngineError::Bind { addr, source });
                }
            };

            let run = Arc::clone(&listener);
            let shutdown = set.shutdown.subscribe();
            set.handles.push(tokio::spawn(async move {
                if let Err(e) = run.run(shutdown).await {
                    error!(error = %e, "Listener error");
                }
            }));
            set.listeners.push(listener);
        }

        Ok(set)
    }

    /// Swap in listeners for `inbound`. The new set is bound while the old
    /// one still runs. Only when it needs a port the old set holds is the
    /// old set stopped first, and it is bound again if the new set still
    /// fails.
    async fn replace_listeners(
        &self,
        running: &mut Running,
        inbound: &InboundConfig,
        inbounds: Vec<(SocketAddr, Arc<dyn Inbound>)>,
    ) -> Result<(), EngineError> {
        let err = match self.start_listeners(inbound, inbounds.clone(), &running.router).await {
            Ok(set) => {
                std::mem::replace(&mut running.listeners, set).stop().await;
                return Ok(());
            }
            Err(err) => err,
        };
        let port_held = matches!(
            &err,
            EngineError::Bind { addr, .. } if running.listeners.holds_port(addr.port())
        );
        if !port_held {
            return Err(err);
        }

        std::mem::replace(&mut running.listeners, ListenerSet::empty())
            .stop()
            .await;
        match self.start_listeners(inbound, inbounds, &running.router).await {
            Ok(set) => {
                running.listeners = set;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Restoring previous listeners");
                running.listeners = self
                    .restore_listeners(&running.config.inbound, &running.router)
                    .await;
                Err(err)
            }
        }
    }

    async fn restore_listeners(
        &self,
        inbound: &InboundConfig,
        router: &Arc<Router>,
    ) -> ListenerSet {
        let restored = match build_inbounds(inbound) {
            Ok(inbounds) => self.start_listeners(inbound, inbounds, router).await,
            Err(e) => Err(e.into()),
        };
        restored.unwrap_or_else(|e| {
            error!(error = %e, "Failed to restore previous listeners");
            ListenerSet::empty()
        })
    }

    async fn shutdown(&self, running: Running) {
        running.listeners.stop().await;
        running.checkers.stop().await;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerSet {
    fn empty() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            listeners: Vec::new(),
            handles: Vec::new(),
        }
    }

    fn holds_port(&self, port: u16) -> bool {
        port != 0
            && self
                .listeners
                .iter()
                .any(|l| l.local_addr().is_ok_and(|local| local.port() == port))
    }

    fn describe(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter_map(|l| Some(format!("{}@{}", l.tag(), l.local_addr().ok()?)))
            .collect()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl CheckerSet {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Listener addresses and handlers for an inbound section.
fn build_inbounds(
    inbound: &InboundConfig,
) -> Result<Vec<(SocketAddr, Arc<dyn Inbound>)>, ConfigError> {
    let mut inbounds: Vec<(SocketAddr, Arc<dyn Inbound>)> = Vec::new();

    if let Some(port) = inbound.mixed_port {
        let mixed =
            MixedInbound::new(MIXED_TAG).with_credentials(inbound.authentication.clone());
        inbounds.push((SocketAddr::new(inbound.bind_address, port), Arc::new(mixed)));
    }

    for tunnel in &inbound.tunnels {
        let handler = TunnelInbound::from_config(tunnel)?;
        inbounds.push((tunnel.listen, Arc::new(handler)));
    }

    for (i, (addr, _)) in inbounds.iter().enumerate() {
        if addr.port() != 0 && inbounds[..i].iter().any(|(other, _)| other == addr) {
            return Err(ConfigError::InvalidInbound(format!(
                "address {addr} is used twice"
            )));
        }
    }

    Ok(inbounds)
}

fn prepare_home(home: &Path) -> Result<PathBuf, EngineError> {
    std::fs::create_dir_all(home)
        .map_err(|e| EngineError::io("failed to create home directory", home, e))?;
    std::fs::canonicalize(home)
        .map_err(|e| EngineError::io("failed to resolve home directory", home, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_inbounds() {
        let mut inbound = InboundConfig {
            mixed_port: Some(7890),
            ..InboundConfig::default()
        };
        inbound.tunnels.push(crate::config::TunnelConfig {
            tag: Some("db".to_string()),
            listen: "127.0.0.1:7891".parse().unwrap(),
            target: "10.0.0.5:5432".to_string(),
        });

        let inbounds = build_inbounds(&inbound).unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0].1.tag(), MIXED_TAG);
        assert_eq!(inbounds[0].0, "127.0.0.1:7890".parse().unwrap());
        assert_eq!(inbounds[1].1.tag(), "db");

        inbound.tunnels[0].listen = "127.0.0.1:7890".parse().unwrap();
        assert!(matches!(build_inbounds(&inbound), Err(ConfigError::InvalidInbound(_))));
    }

    #[tokio::test]
    async fn test_operations_before_setup() {
        let engine = Engine::new();
        assert!(matches!(engine.reload().await, Err(EngineError::NotStarted)));
        assert!(matches!(
            engine.reload_with_config(b"rules = []").await,
            Err(EngineError::NotStarted)
        ));
        assert!(matches!(
            engine.reload_with_base64("cnVsZXMgPSBbXQ==").await,
            Err(EngineError::NotStarted)
        ));
        assert!(matches!(engine.subscribe().await, Err(EngineError::NotStarted)));
        assert!(matches!(
            engine.select_proxy("g", "n").await,
            Err(EngineError::NotStarted)
        ));
        // Stop is idempotent even before setup.
        engine.stop().await;
        assert!(!engine.is_running().await);
    }
}
