//! Shared TCP dialing with a bounded connect timeout.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::AdapterError;

/// Connect to `host:port`, resolving names through the system resolver.
pub async fn dial_tcp(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, AdapterError> {
    let target = format_target(host, port);
    debug!(target = %target, "Dialing");

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(AdapterError::Dial { target, source }),
        Err(_) => {
            return Err(AdapterError::Timeout {
                target,
                after: connect_timeout,
            })
        }
    };

    // Not fatal; some platforms refuse it on loopback.
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = dial_tcp("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Dial { .. }));
    }

    #[test]
    fn test_format_target() {
        assert_eq!(format_target("::1", 80), "[::1]:80");
        assert_eq!(format_target("[::1]", 80), "[::1]:80");
        assert_eq!(format_target("example.com", 443), "example.com:443");
    }
}
