//! TCP readiness checks.
//!
//! A server counts as ready once something accepts a TCP connection on its port.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

pub const DEFAULT_HOST: &str = "localhost";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// How a port is probed while waiting for a server.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Host to connect to.
    pub host: String,
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Sleep between failed attempts.
    pub poll_interval: Duration,
}

/// Result of waiting for a server's port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A connection succeeded.
    Ready,
    /// The deadline passed without a successful connection.
    TimedOut,
    /// The server process failed before its port opened.
    Exited(ExitStatus),
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl ReadinessProbe {
    /// Makes a single connection attempt.
    pub async fn probe(&self, port: u16) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), port));
        matches!(
            tokio::time::timeout(self.connect_timeout, connect).await,
            Ok(Ok(_))
        )
    }

    /// Polls `port` until it accepts a connection or `timeout` elapses.
    ///
    /// `exited` is consulted between attempts so a server that fails early is not
    /// waited on for the full timeout. A successful exit keeps polling: launchers
    /// such as `docker run -d` return before the daemon they start is listening.
    /// At least one attempt is always made.
    pub async fn wait_until_ready<F>(&self, port: u16, timeout: Duration, mut exited: F) -> Readiness
    where
        F: FnMut() -> Option<ExitStatus>,
    {
        let start = Instant::now();
        loop {
            if self.probe(port).await {
                return Readiness::Ready;
            }
            if let Some(status) = exited().filter(|status| !status.success()) {
                return Readiness::Exited(status);
            }
            if start.elapsed() >= timeout {
                return Readiness::TimedOut;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_probe() -> ReadinessProbe {
        ReadinessProbe {
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn ready_when_port_is_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let readiness = fast_probe()
            .wait_until_ready(port, Duration::from_secs(2), || None)
            .await;
        assert_eq!(readiness, Readiness::Ready);
    }

    #[tokio::test]
    async fn times_out_when_nothing_listens() {
        let port = closed_port().await;
        let start = std::time::Instant::now();
        let readiness = fast_probe()
            .wait_until_ready(port, Duration::from_millis(150), || None)
            .await;
        assert_eq!(readiness, Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn becomes_ready_once_listener_appears() {
        let port = closed_port().await;
        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });
        let readiness = fast_probe()
            .wait_until_ready(port, Duration::from_secs(2), || None)
            .await;
        assert_eq!(readiness, Readiness::Ready);
        opener.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stops_early_when_server_exits() {
        use std::os::unix::process::ExitStatusExt;

        let port = closed_port().await;
        let status = ExitStatus::from_raw(3 << 8);
        let readiness = fast_probe()
            .wait_until_ready(port, Duration::from_secs(10), || Some(status))
            .await;
        assert_eq!(readiness, Readiness::Exited(status));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_exit_keeps_polling() {
        use std::os::unix::process::ExitStatusExt;

        let port = closed_port().await;
        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });
        let readiness = fast_probe()
            .wait_until_ready(port, Duration::from_secs(2), || Some(ExitStatus::from_raw(0)))
            .await;
        assert_eq!(readiness, Readiness::Ready);
        opener.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_exit_still_times_out() {
        use std::os::unix::process::ExitStatusExt;

        let port = closed_port().await;
        let readiness = fast_probe()
            .wait_until_ready(port, Duration::from_millis(150), || {
                Some(ExitStatus::from_raw(0))
            })
            .await;
        assert_eq!(readiness, Readiness::TimedOut);
    }
}
