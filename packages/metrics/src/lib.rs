//! # fngate-metrics
//!
//! Wall-clock timing of operations, reported as one UDP datagram per
//! event:
//!
//! ```json
//! {"client": "fngate", "metric": "function-run", "time": 12, "status": 200}
//! ```
//!
//! Emission never fails the caller. Without a configured client nothing is
//! sent at all, and send errors are only logged.

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::UdpSocket;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to bind metric socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Failed to resolve metric host {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Metric host {host}:{port} has no address")]
    NoAddress { host: String, port: u16 },
}

/// Where and as whom metrics are reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Client name stamped on every event. `None` disables emission.
    pub client: Option<String>,
    pub udp_host: String,
    pub udp_port: u16,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            client: None,
            udp_host: "127.0.0.1".to_string(),
            udp_port: 8125,
        }
    }
}

struct Destination {
    client: String,
    socket: UdpSocket,
    addr: SocketAddr,
}

/// Process-wide metric sender.
///
/// Owns the UDP socket for the life of the worker; dropping the emitter
/// closes it.
pub struct MetricEmitter {
    destination: Option<Destination>,
}

impl MetricEmitter {
    /// Open the metric socket, or build a disabled emitter when no client
    /// is configured.
    ///
    /// The destination is resolved once here rather than per event.
    pub async fn connect(config: &MetricConfig) -> Result<Self, Error> {
        let Some(client) = config.client.clone() else {
            return Ok(Self::disabled());
        };

        let addr = tokio::net::lookup_host((config.udp_host.as_str(), config.udp_port))
            .await
            .map_err(|source| Error::Resolve {
                host: config.udp_host.clone(),
                port: config.udp_port,
                source,
            })?
            .next()
            .ok_or_else(|| Error::NoAddress {
                host: config.udp_host.clone(),
                port: config.udp_port,
            })?;

        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(Error::Bind)?;

        tracing::debug!(%addr, client = %client, "Metric socket opened");
        Ok(Self {
            destination: Some(Destination {
                client,
                socket,
                addr,
            }),
        })
    }

    pub fn disabled() -> Self {
        Self { destination: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.destination.is_some()
    }

    /// Start timing `metric`.
    pub fn start(&self, metric: impl Into<String>) -> Metric<'_> {
        Metric {
            emitter: self,
            metric: metric.into(),
            started: Instant::now(),
        }
    }

    fn send(&self, metric: &str, time: u64, extra: Option<Map<String, Value>>) {
        let Some(destination) = &self.destination else {
            return;
        };

        let mut event = Map::new();
        event.insert("client".to_string(), Value::from(destination.client.clone()));
        event.insert("metric".to_string(), Value::from(metric));
        event.insert("time".to_string(), Value::from(time));
        // Caller fields win over the defaults.
        event.extend(extra.unwrap_or_default());

        let payload = match serde_json::to_vec(&Value::Object(event)) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(metric, "Failed to encode udp metric: {}", e);
                return;
            }
        };

        if let Err(e) = destination.socket.try_send_to(&payload, destination.addr) {
            tracing::error!(metric, "Failed to send udp metric: {}", e);
        }
    }
}

/// A running timer for one operation.
pub struct Metric<'a> {
    emitter: &'a MetricEmitter,
    metric: String,
    started: Instant,
}

impl Metric<'_> {
    /// Stop the timer, report the event, and return the elapsed
    /// milliseconds.
    pub fn finish(self, extra: Option<Map<String, Value>>) -> u64 {
        let spent = self.started.elapsed().as_millis() as u64;
        self.emitter.send(&self.metric, spent, extra);
        spent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn disabled_without_client() {
        let emitter = MetricEmitter::connect(&MetricConfig::default())
            .await
            .unwrap();
        assert!(!emitter.is_enabled());

        let metric = emitter.start("slow-op");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(metric.finish(None) >= 20);
    }

    #[tokio::test]
    async fn sends_one_datagram_per_event() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let emitter = MetricEmitter::connect(&MetricConfig {
            client: Some("fngate-test".to_string()),
            udp_host: "127.0.0.1".to_string(),
            udp_port: port,
        })
        .await
        .unwrap();
        assert!(emitter.is_enabled());

        let extra = json!({"namespace": "ns", "status": 200});
        let spent = emitter
            .start("function-run")
            .finish(extra.as_object().cloned());

        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let event: Value = serde_json::from_slice(&buf[..n]).unwrap();

        assert_eq!(event["client"], "fngate-test");
        assert_eq!(event["metric"], "function-run");
        assert_eq!(event["time"], spent);
        assert_eq!(event["namespace"], "ns");
        assert_eq!(event["status"], 200);
    }

    #[tokio::test]
    async fn extra_fields_override_defaults() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let emitter = MetricEmitter::connect(&MetricConfig {
            client: Some("fngate-test".to_string()),
            udp_host: "127.0.0.1".to_string(),
            udp_port: port,
        })
        .await
        .unwrap();

        emitter
            .start("op")
            .finish(json!({"client": "override"}).as_object().cloned());

        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let event: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(event["client"], "override");
    }

    #[tokio::test]
    async fn unresolvable_host_is_an_error() {
        let result = MetricEmitter::connect(&MetricConfig {
            client: Some("fngate-test".to_string()),
            udp_host: "host.invalid".to_string(),
            udp_port: 8125,
        })
        .await;
        assert!(result.is_err());
    }
}
