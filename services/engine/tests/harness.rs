//! Test harness for engine integration tests.
//!
//! Provides helpers to spawn echo and HTTP status backends, fake SOCKS5 and
//! Trojan upstreams, and client-side handshakes against the mixed listener.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha224};
use tempfile::TempDir;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use switchyard_engine::adapter::{AdapterError, BoxedStream, Destination, ProtocolAdapter};
use switchyard_engine::proxy::ConnMetadata;
use switchyard_engine::{AdapterRegistry, Engine};

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Answers every HTTP request with a fixed status line and closes.
#[allow(dead_code)]
pub struct StatusBackend {
    pub addr: SocketAddr,
    pub requests: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl StatusBackend {
    pub async fn spawn(status: u16) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let counter = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let mut buf = [0u8; 1024];
                            if matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {
                                counter.fetch_add(1, Ordering::Relaxed);
                                let response = format!(
                                    "HTTP/1.1 {status} Status\r\nContent-Length: 0\r\n\r\n"
                                );
                                let _ = stream.write_all(response.as_bytes()).await;
                                let _ = stream.shutdown().await;
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Probe URL pointing at this backend.
    pub fn url(&self) -> String {
        format!("http://{}/generate_204", self.addr)
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Drop for StatusBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// No-auth SOCKS5 server that records requested destinations.
///
/// Literal IP destinations are dialed as requested; domain names are sent
/// to `domain_target` so tests never need DNS.
#[allow(dead_code)]
pub struct Socks5Upstream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub requested: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Socks5Upstream {
    pub async fn spawn(domain_target: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let requested = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let requested_clone = Arc::clone(&requested);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        let requested = Arc::clone(&requested_clone);
                        tokio::spawn(async move {
                            let _ = serve_socks5(stream, domain_target, requested).await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            requested,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl Drop for Socks5Upstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_socks5(
    mut stream: TcpStream,
    domain_target: SocketAddr,
    requested: Arc<Mutex<Vec<String>>>,
) -> io::Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;
    let (host, port) = read_addr(&mut stream).await?;
    requested.lock().unwrap().push(format!("{host}:{port}"));

    let target = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => domain_target,
    };
    let mut upstream = match TcpStream::connect(target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            stream.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            return Err(e);
        }
    };
    stream.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0]).await?;
    copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}

/// Upstream that accepts connections and never answers. Counts accepted
/// connections and the ones the peer has since closed.
#[allow(dead_code)]
pub struct StalledUpstream {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl StalledUpstream {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accepted_clone = Arc::clone(&accepted);
        let closed_clone = Arc::clone(&closed);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        accepted_clone.fetch_add(1, Ordering::Relaxed);
                        let closed = Arc::clone(&closed_clone);
                        tokio::spawn(async move {
                            let mut buf = [0u8; 512];
                            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                            closed.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            accepted,
            closed,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

impl Drop for StalledUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Read a SOCKS-style `ATYP | address | port`.
async fn read_addr<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(String, u16)> {
    let atyp = stream.read_u8().await?;
    let host = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets).to_string()
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets).to_string()
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(io::Error::other)?
        }
        other => return Err(io::Error::other(format!("bad atyp {other}"))),
    };
    let port = stream.read_u16().await?;
    Ok((host, port))
}

/// Trojan-over-TLS server with a self-signed certificate for `localhost`.
/// Requests carrying the right password hash are forwarded to `forward_to`.
#[allow(dead_code)]
pub struct TrojanUpstream {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicU64>,
    pub refused: Arc<AtomicU64>,
    pub requested: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TrojanUpstream {
    pub async fn spawn(password: &str, forward_to: SocketAddr) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(io::Error::other)?;
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(io::Error::other)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let expected_hash = hex::encode(Sha224::digest(password.as_bytes()));

        let accepted = Arc::new(AtomicU64::new(0));
        let refused = Arc::new(AtomicU64::new(0));
        let requested = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accepted_clone = Arc::clone(&accepted);
        let refused_clone = Arc::clone(&refused);
        let requested_clone = Arc::clone(&requested);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        let acceptor = acceptor.clone();
                        let expected_hash = expected_hash.clone();
                        let accepted = Arc::clone(&accepted_clone);
                        let refused = Arc::clone(&refused_clone);
                        let requested = Arc::clone(&requested_clone);
                        tokio::spawn(async move {
                            let Ok(mut tls) = acceptor.accept(stream).await else { return };
                            match read_trojan_header(&mut tls, &expected_hash).await {
                                Ok(destination) => {
                                    accepted.fetch_add(1, Ordering::Relaxed);
                                    requested.lock().unwrap().push(destination);
                                    if let Ok(mut upstream) = TcpStream::connect(forward_to).await {
                                        let _ =
                                            copy_bidirectional(&mut tls, &mut upstream).await;
                                    }
                                }
                                Err(_) => {
                                    refused.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            accepted,
            refused,
            requested,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl Drop for TrojanUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn read_trojan_header<S: AsyncRead + Unpin>(
    stream: &mut S,
    expected_hash: &str,
) -> io::Result<String> {
    let mut hash = [0u8; 56];
    stream.read_exact(&mut hash).await?;
    if hash != expected_hash.as_bytes() {
        return Err(io::Error::other("password hash mismatch"));
    }
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
    let cmd = stream.read_u8().await?;
    if cmd != 0x01 {
        return Err(io::Error::other(format!("unexpected command {cmd}")));
    }
    let (host, port) = read_addr(stream).await?;
    stream.read_exact(&mut crlf).await?;
    Ok(format!("{host}:{port}"))
}

/// Adapter that counts attempts and always fails to dial.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct FailingAdapter {
    pub attempts: AtomicU64,
}

#[async_trait]
impl ProtocolAdapter for FailingAdapter {
    fn kind(&self) -> &'static str {
        "failing"
    }

    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, AdapterError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(AdapterError::Dial {
            target: destination.to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        })
    }
}

/// Built-in adapters plus `failing`, sharing one [`FailingAdapter`].
#[allow(dead_code)]
pub fn registry_with_failing() -> (AdapterRegistry, Arc<FailingAdapter>) {
    let failing = Arc::new(FailingAdapter::default());
    let mut registry = AdapterRegistry::with_builtins();
    let shared = Arc::clone(&failing);
    registry.register("failing", move |_, _| Ok(Arc::clone(&shared) as Arc<dyn ProtocolAdapter>));
    (registry, failing)
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Metadata for a client connection to `host:port` through the mixed inbound.
#[allow(dead_code)]
pub fn meta(host: &str, port: u16) -> ConnMetadata {
    ConnMetadata::new(
        "127.0.0.1:50000".parse().unwrap(),
        &Destination::from_host(host, port),
        "mixed",
    )
}

/// An engine running from a temporary home directory.
#[allow(dead_code)]
pub struct EngineHandle {
    pub engine: Engine,
    pub home: TempDir,
}

#[allow(dead_code)]
impl EngineHandle {
    /// Set up from raw TOML.
    pub async fn start(config: &str) -> Self {
        Self::start_with(Engine::new(), config).await
    }

    pub async fn start_with(engine: Engine, config: &str) -> Self {
        let home = tempfile::tempdir().unwrap();
        engine.setup(home.path(), config).await.unwrap();
        Self { engine, home }
    }

    /// Address of the listener tagged `tag`.
    pub async fn listener_addr(&self, tag: &str) -> SocketAddr {
        self.engine
            .local_addrs()
            .await
            .unwrap()
            .into_iter()
            .find(|(t, _)| t == tag)
            .map(|(_, addr)| addr)
            .unwrap()
    }

    pub async fn mixed_addr(&self) -> SocketAddr {
        self.listener_addr("mixed").await
    }
}

/// SOCKS5 CONNECT to `host:port` through `proxy`. Returns the stream and
/// the reply code.
#[allow(dead_code)]
pub async fn socks5_connect(
    proxy: SocketAddr,
    host: &str,
    port: u16,
) -> io::Result<(TcpStream, u8)> {
    let mut stream = socks5_request(proxy, host, port).await?;
    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await?;
    read_addr(&mut stream).await?;
    Ok((stream, reply[1]))
}

/// Negotiate no-auth and send a CONNECT request without waiting for the
/// reply.
#[allow(dead_code)]
pub async fn socks5_request(proxy: SocketAddr, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(io::Error::other(format!("unexpected method reply {choice:?}")));
    }

    let mut request = vec![0x05, 0x01, 0x00];
    Destination::from_host(host, port)
        .write_socks_addr(&mut request)
        .map_err(io::Error::other)?;
    stream.write_all(&request).await?;
    Ok(stream)
}

/// Write `payload` and read the same number of bytes back.
#[allow(dead_code)]
pub async fn echo_roundtrip<S>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    })
    .await
    .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}

/// Poll `check` until it holds or `within` elapses.
#[allow(dead_code)]
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
