use std::{
    io,
    sync::Arc,
    thread::JoinHandle,
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{
    message::{EngineCommand, EngineEvent, EventSink},
    task::Task,
};
use crate::worker::{poller::spawn_poller, worker::spawn_worker_thread};
use super::supervisor::{RunningInfo, Started, Stopped, Supervisor};

/// Entry point for the rest of the application.
///
/// Synchronous calls (`start`, `stop`) return their result directly and may
/// block for a spawn or a grace period. The `_async` variants are queued to a
/// command worker; their failures arrive as [`EngineEvent::StartFailed`].
/// Events for one task arrive in the order they happened.
pub struct TaskManager {
    supervisor: Arc<Supervisor>,
    sender: Sender<EngineCommand>,
    events: Receiver<EngineEvent>,
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl TaskManager {
    /// Builds the engine and starts the poller and command worker threads.
    pub fn spawn(config: EngineConfig) -> io::Result<Self> {
        let (event_tx, events) = unbounded();
        let sink: Arc<dyn EventSink> = Arc::new(event_tx);
        let poll_interval = config.poll_interval;
        let supervisor = Arc::new(Supervisor::new(config, Arc::clone(&sink)));

        let (sender, receiver) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let worker = spawn_worker_thread(receiver, Arc::clone(&supervisor), sink)?;
        let poller = spawn_poller(Arc::clone(&supervisor), poll_interval, shutdown_rx)?;

        Ok(TaskManager {
            supervisor,
            sender,
            events,
            shutdown: Some(shutdown_tx),
            threads: vec![worker, poller],
        })
    }

    pub fn start(&self, task: &Task) -> Result<Started, EngineError> {
        self.supervisor.start(task)
    }

    pub fn stop(&self, id: &str) -> Result<Stopped, EngineError> {
        self.supervisor.stop(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.supervisor.is_running(id)
    }

    pub fn start_async(&self, task: Task) {
        self.send(EngineCommand::Start(task));
    }

    pub fn stop_async(&self, id: &str) {
        self.send(EngineCommand::Stop(id.to_string()));
    }

    /// Starts every task of a group; one failure does not prevent the others.
    pub fn start_group(&self, tasks: &[Task]) -> Vec<(String, Result<Started, EngineError>)> {
        tasks
            .iter()
            .map(|task| (task.id.clone(), self.supervisor.start(task)))
            .collect()
    }

    pub fn stop_all(&self) -> Vec<Stopped> {
        self.supervisor.stop_all()
    }

    /// Called when a task is deleted from the registry: tears it down if it runs.
    pub fn forget(&self, id: &str) -> Option<Stopped> {
        self.supervisor.stop(id).ok()
    }

    pub fn running_tasks(&self) -> Vec<RunningInfo> {
        self.supervisor.running_tasks()
    }

    /// The event stream. Receivers are clones of one queue: each event is
    /// delivered to exactly one of them.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.clone()
    }

    /// Stops the background threads and, if configured, every running task.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn send(&self, command: EngineCommand) {
        if let Err(e) = self.sender.send(command) {
            warn!("Command worker is gone, dropping {:?}", e.into_inner());
        }
    }

    fn close(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.take();
        self.send(EngineCommand::Shutdown);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("A background thread panicked.");
            }
        }
        if self.supervisor.config().stop_on_shutdown {
            let stopped = self.supervisor.stop_all();
            info!("Stopped {} task(s) on shutdown.", stopped.len());
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.close();
    }
}
