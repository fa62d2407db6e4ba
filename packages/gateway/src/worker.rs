//! A single worker process.
//!
//! Each worker owns its own HTTP client, sandbox, metric socket and store
//! handle, binds the shared port with `SO_REUSEPORT`, and serves the
//! functions router on a current-thread runtime. It tells the supervisor
//! when it is ready and when it stops accepting requests.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fngate_code_store::{CodeStore, InMemoryCodeStore, LocalDiskCodeStore};
use fngate_http::{HttpExecutor, ReqwestExecutor};
use fngate_metrics::MetricEmitter;
use fngate_sandbox::WasmSandbox;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpSocket};

use crate::config::{Settings, StorageKind};
use crate::error::Error;
use crate::router::FunctionsRouter;
use crate::signal;
use crate::supervisor::WorkerMessage;

/// Run a worker until it is told to stop.
pub fn run(settings: Settings) -> Result<(), Error> {
    install_panic_hook();

    // The blocking client runs its own runtime and must be built outside ours.
    let http: Arc<dyn HttpExecutor> = Arc::new(ReqwestExecutor::new(&settings.client_defaults())?);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(settings, http));
    // A pending stdin read would otherwise hold shutdown open.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn serve(settings: Settings, http: Arc<dyn HttpExecutor>) -> Result<(), Error> {
    let metrics = Arc::new(MetricEmitter::connect(&settings.metric_config()).await?);
    let store = open_store(&settings).await?;
    let sandbox = Arc::new(WasmSandbox::new(settings.sandbox_config(), http)?);
    let app = FunctionsRouter::new(store, sandbox, metrics)?.into_router();

    let listener = bind(settings.listen_addr())?;
    tracing::info!(
        pid = std::process::id(),
        addr = %settings.listen_addr(),
        "Functions beating on port {}",
        settings.port
    );
    announce(WorkerMessage::Ready)?;

    axum::serve(listener, app)
        .with_graceful_shutdown(stop_requested())
        .await?;

    tracing::info!(pid = std::process::id(), "Worker stopped");
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn CodeStore>, Error> {
    match settings.storage {
        StorageKind::Disk => {
            let store = LocalDiskCodeStore::open(&settings.storage_dir).await?;
            tracing::debug!(root = %store.root().display(), "Using disk store");
            Ok(Arc::new(store))
        }
        StorageKind::Memory => {
            if settings.worker_count() > 1 {
                tracing::warn!(
                    workers = settings.worker_count(),
                    "Memory storage is per process; workers will not share functions"
                );
            }
            Ok(Arc::new(InMemoryCodeStore::new()))
        }
    }
}

/// Bind `addr` so that every worker can listen on it at once.
pub fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

fn announce(message: WorkerMessage) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", message.as_str())?;
    stdout.flush()
}

/// Resolve when the worker should stop accepting requests: on a signal, or
/// when the supervisor closes our stdin.
async fn stop_requested() {
    let supervisor_gone = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    };

    tokio::select! {
        _ = signal::terminated() => {}
        _ = supervisor_gone => tracing::info!("Supervisor closed the control pipe"),
    }

    if let Err(e) = announce(WorkerMessage::Disconnect) {
        tracing::warn!("Failed to notify supervisor: {}", e);
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let thread = std::thread::current();
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            "Worker panicked: {}\n{}",
            info,
            backtrace
        );
    }));
}
