//! Keeps a fixed pool of worker processes alive.
//!
//! [`Supervisor`] is a plain state machine: it is fed [`WorkerEvent`]s and
//! reacts through a [`WorkerSpawner`], which makes the respawn rules
//! testable without real processes. [`ProcessSpawner`] is the production
//! spawner and [`run`] drives the two together.
//!
//! Respawn rules:
//!
//! - A worker that disconnects is replaced once. The replacement waits for
//!   [`Supervisor::replace_disconnected`], so a shutdown signal that
//!   arrives together with the disconnect can still cancel it.
//! - A worker that exits is replaced only if nothing replaced it already
//!   and the supervisor did not ask it to stop.
//! - Nothing is replaced while shutting down.
//!
//! A worker that disconnects and then exits is therefore replaced exactly
//! once.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::error::Error;
use crate::signal;

pub type WorkerId = u64;

/// How long a disconnect waits for a shutdown signal before its worker is
/// replaced. A terminal's Ctrl-C reaches every worker and the supervisor at
/// once, and a worker may report first.
const DISCONNECT_GRACE: Duration = Duration::from_millis(100);

/// Lines a worker writes to stdout for its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Listening and serving requests.
    Ready,
    /// No longer accepting requests; about to exit.
    Disconnect,
}

impl WorkerMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "ready",
            WorkerMessage::Disconnect => "disconnect",
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "ready" => Some(WorkerMessage::Ready),
            "disconnect" => Some(WorkerMessage::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Ready { id: WorkerId },
    Disconnected { id: WorkerId },
    Exited { id: WorkerId, code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Disconnected,
}

/// Why a worker went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Asked to stop, or disconnected before exiting.
    Planned,
    Crashed,
}

#[derive(Debug)]
struct WorkerRecord {
    pid: u32,
    state: WorkerState,
    replaced: bool,
    stop_requested: bool,
}

/// Starts and stops worker processes.
pub trait WorkerSpawner {
    /// Start worker `id`, returning its process id.
    fn spawn(&mut self, id: WorkerId) -> io::Result<u32>;

    /// Ask worker `id` to shut down gracefully.
    fn stop(&mut self, id: WorkerId);

    /// Drop anything still held for an exited worker.
    fn release(&mut self, _id: WorkerId) {}
}

pub struct Supervisor<P: WorkerSpawner> {
    spawner: P,
    size: usize,
    next_id: WorkerId,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    pending_replacements: usize,
    shutting_down: bool,
}

impl<P: WorkerSpawner> Supervisor<P> {
    pub fn new(spawner: P, size: usize) -> Self {
        Self {
            spawner,
            size,
            next_id: 1,
            workers: BTreeMap::new(),
            pending_replacements: 0,
            shutting_down: false,
        }
    }

    /// Fork the initial pool.
    pub fn start(&mut self) {
        tracing::info!(workers = self.size, "Starting workers");
        for _ in 0..self.size {
            self.spawn_worker();
        }
    }

    /// Apply one worker event.
    ///
    /// # Returns
    ///
    /// The termination reason when the event was an exit of a known worker.
    pub fn handle(&mut self, event: WorkerEvent) -> Option<TerminationReason> {
        match event {
            WorkerEvent::Ready { id } => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.state = WorkerState::Running;
                    tracing::info!(worker = id, pid = worker.pid, "Worker ready");
                }
                None
            }
            WorkerEvent::Disconnected { id } => {
                let shutting_down = self.shutting_down;
                let worker = self.workers.get_mut(&id)?;
                tracing::warn!(worker = id, pid = worker.pid, "Worker disconnected");
                worker.state = WorkerState::Disconnected;

                if !shutting_down && !worker.replaced && !worker.stop_requested {
                    worker.replaced = true;
                    self.pending_replacements += 1;
                }
                None
            }
            WorkerEvent::Exited { id, code } => {
                let worker = self.workers.remove(&id)?;
                self.spawner.release(id);

                let reason = if worker.stop_requested || worker.state == WorkerState::Disconnected
                {
                    TerminationReason::Planned
                } else {
                    TerminationReason::Crashed
                };
                tracing::warn!(worker = id, pid = worker.pid, ?code, ?reason, "Worker died");

                if !self.shutting_down && !worker.replaced && !worker.stop_requested {
                    self.spawn_worker();
                }
                Some(reason)
            }
        }
    }

    /// Spawn the replacements owed to disconnected workers.
    ///
    /// # Returns
    ///
    /// The number of workers spawned.
    pub fn replace_disconnected(&mut self) -> usize {
        let owed = std::mem::take(&mut self.pending_replacements);
        if self.shutting_down {
            return 0;
        }
        (0..owed).filter_map(|_| self.spawn_worker()).count()
    }

    /// Whether a disconnect is waiting for its replacement.
    pub fn has_pending_replacements(&self) -> bool {
        self.pending_replacements > 0
    }

    /// Stop every live worker and stop replacing them.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.pending_replacements = 0;
        for (id, worker) in self.workers.iter_mut() {
            if !worker.stop_requested {
                worker.stop_requested = true;
                self.spawner.stop(*id);
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Workers that have not exited yet, counting owed replacements.
    pub fn live_workers(&self) -> usize {
        self.workers.len() + self.pending_replacements
    }

    pub fn state(&self, id: WorkerId) -> Option<WorkerState> {
        self.workers.get(&id).map(|worker| worker.state)
    }

    pub fn spawner(&self) -> &P {
        &self.spawner
    }

    fn spawn_worker(&mut self) -> Option<WorkerId> {
        let id = self.next_id;
        self.next_id += 1;

        match self.spawner.spawn(id) {
            Ok(pid) => {
                tracing::info!(worker = id, pid, "Worker started");
                self.workers.insert(
                    id,
                    WorkerRecord {
                        pid,
                        state: WorkerState::Starting,
                        replaced: false,
                        stop_requested: false,
                    },
                );
                Some(id)
            }
            Err(e) => {
                tracing::error!(worker = id, "Failed to start worker: {}", e);
                None
            }
        }
    }
}

/// Spawns workers as child processes of the current executable.
///
/// Workers report over stdout and are told to stop by closing their stdin.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    stdins: HashMap<WorkerId, ChildStdin>,
}

impl ProcessSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            events,
            stdins: HashMap::new(),
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self, id: WorkerId) -> io::Result<u32> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pid = child.id().unwrap_or_default();
        if let Some(stdin) = child.stdin.take() {
            self.stdins.insert(id, stdin);
        }
        let stdout = child.stdout.take();
        tokio::spawn(watch_worker(id, child, stdout, self.events.clone()));

        Ok(pid)
    }

    fn stop(&mut self, id: WorkerId) {
        // EOF on stdin is the worker's cue to drain and exit.
        self.stdins.remove(&id);
    }

    fn release(&mut self, id: WorkerId) {
        self.stdins.remove(&id);
    }
}

async fn watch_worker(
    id: WorkerId,
    mut child: Child,
    stdout: Option<ChildStdout>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let event = match WorkerMessage::parse(&line) {
                        Some(WorkerMessage::Ready) => WorkerEvent::Ready { id },
                        Some(WorkerMessage::Disconnect) => WorkerEvent::Disconnected { id },
                        None => {
                            tracing::debug!(worker = id, "Worker output: {}", line);
                            continue;
                        }
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = id, "Failed to read worker output: {}", e);
                    break;
                }
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(worker = id, "Failed to wait for worker: {}", e);
            None
        }
    };
    let _ = events.send(WorkerEvent::Exited { id, code });
}

/// Run the supervisor until it is told to stop and every worker has exited.
pub async fn run(settings: &Settings) -> Result<(), Error> {
    let (events, mut received) = mpsc::unbounded_channel();
    let spawner = ProcessSpawner::new(std::env::current_exe()?, settings.worker_args(), events);
    let mut supervisor = Supervisor::new(spawner, settings.worker_count());

    supervisor.start();

    let shutdown = signal::terminated();
    tokio::pin!(shutdown);

    loop {
        if supervisor.live_workers() == 0 {
            if supervisor.is_shutting_down() {
                break;
            }
            return Err(Error::NoWorkers);
        }

        tokio::select! {
            biased;
            _ = &mut shutdown, if !supervisor.is_shutting_down() => {
                tracing::info!(workers = supervisor.live_workers(), "Shutting down workers");
                supervisor.begin_shutdown();
            }
            event = received.recv() => match event {
                Some(event) => {
                    supervisor.handle(event);
                }
                None => break,
            },
        }

        if supervisor.has_pending_replacements() {
            tokio::select! {
                biased;
                _ = &mut shutdown, if !supervisor.is_shutting_down() => {
                    tracing::info!(workers = supervisor.live_workers(), "Shutting down workers");
                    supervisor.begin_shutdown();
                }
                _ = tokio::time::sleep(DISCONNECT_GRACE) => {}
            }
            supervisor.replace_disconnected();
        }
    }

    tracing::info!("All workers stopped");
    Ok(())
}
