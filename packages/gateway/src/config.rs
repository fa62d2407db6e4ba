//! Command-line and environment configuration.
//!
//! Every flag can also be set through an `FNGATE_*` environment variable.
//! The supervisor hands its resolved settings to each worker as arguments,
//! so workers never depend on the environment they were spawned in.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use fngate_http::ClientDefaults;
use fngate_metrics::MetricConfig;
use fngate_sandbox::SandboxConfig;

/// Where function code lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// Files under `--storage-dir`, shared by every worker.
    Disk,
    /// Per-process memory. Workers do not see each other's functions.
    Memory,
}

impl StorageKind {
    fn as_str(self) -> &'static str {
        match self {
            StorageKind::Disk => "disk",
            StorageKind::Memory => "memory",
        }
    }
}

/// fngate - HTTP gateway for sandboxed functions
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "fngate")]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// Port every worker listens on
    #[arg(long, env = "FNGATE_PORT", default_value_t = 8100)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "FNGATE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Number of worker processes
    #[arg(long, env = "FNGATE_WORKERS", default_value_t = default_workers())]
    pub workers: usize,

    /// Code storage backend
    #[arg(long, env = "FNGATE_STORAGE", value_enum, default_value_t = StorageKind::Disk)]
    pub storage: StorageKind,

    /// Root directory of the disk store
    #[arg(long, env = "FNGATE_STORAGE_DIR", default_value = "./data/functions")]
    pub storage_dir: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "FNGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Client name for UDP metrics; metrics are off when unset
    #[arg(long, env = "FNGATE_METRIC_CLIENT")]
    pub metric_client: Option<String>,

    #[arg(long, env = "FNGATE_METRIC_UDP_HOST", default_value = "127.0.0.1")]
    pub metric_udp_host: String,

    #[arg(long, env = "FNGATE_METRIC_UDP_PORT", default_value_t = 8125)]
    pub metric_udp_port: u16,

    /// Fuel each function run may consume
    #[arg(long, env = "FNGATE_SANDBOX_FUEL", default_value_t = 500_000_000)]
    pub sandbox_fuel: u64,

    /// Maximum linear memory of a function run, in bytes
    #[arg(long, env = "FNGATE_SANDBOX_MAX_MEMORY", default_value_t = 64 * 1024 * 1024)]
    pub sandbox_max_memory: usize,

    /// Timeout for outbound requests made by functions
    #[arg(long, env = "FNGATE_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Run as a worker process (set by the supervisor)
    #[arg(long, hide = true)]
    pub worker: bool,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Settings {
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn metric_config(&self) -> MetricConfig {
        MetricConfig {
            client: self.metric_client.clone(),
            udp_host: self.metric_udp_host.clone(),
            udp_port: self.metric_udp_port,
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            fuel: self.sandbox_fuel,
            max_memory_bytes: self.sandbox_max_memory,
        }
    }

    pub fn client_defaults(&self) -> ClientDefaults {
        ClientDefaults::default().with_timeout(Duration::from_secs(self.http_timeout_secs))
    }

    /// Arguments that start a worker with these settings.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--worker".to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--host".to_string(),
            self.host.to_string(),
            "--workers".to_string(),
            self.workers.to_string(),
            "--storage".to_string(),
            self.storage.as_str().to_string(),
            "--storage-dir".to_string(),
            self.storage_dir.display().to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
            "--metric-udp-host".to_string(),
            self.metric_udp_host.clone(),
            "--metric-udp-port".to_string(),
            self.metric_udp_port.to_string(),
            "--sandbox-fuel".to_string(),
            self.sandbox_fuel.to_string(),
            "--sandbox-max-memory".to_string(),
            self.sandbox_max_memory.to_string(),
            "--http-timeout-secs".to_string(),
            self.http_timeout_secs.to_string(),
        ];
        if let Some(client) = &self.metric_client {
            args.push("--metric-client".to_string());
            args.push(client.clone());
        }
        args
    }
}
