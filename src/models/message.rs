use crossbeam_channel::Sender;
use log::debug;

use super::task::{StreamKind, Task};

/// Requests handled by the command worker thread.
#[derive(Debug)]
pub enum EngineCommand {
    Start(Task),
    Stop(String),
    StopAll,
    Shutdown,
}

/// Notifications delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StatusChanged { task_id: String, running: bool },
    OutputReceived { task_id: String, stream: StreamKind, text: String },
    StartFailed { task_id: String, reason: String },
}

impl EngineEvent {
    pub fn task_id(&self) -> &str {
        match self {
            EngineEvent::StatusChanged { task_id, .. }
            | EngineEvent::OutputReceived { task_id, .. }
            | EngineEvent::StartFailed { task_id, .. } => task_id,
        }
    }
}

/// Destination for engine notifications. Called concurrently from relay
/// workers, the poller, and whichever thread issued start/stop.
///
/// Status changes are emitted while the supervisor holds its registry lock,
/// so `emit` must not call back into the engine (`is_running`, `poll`,
/// `start`, `stop`, ...) on the emitting thread; that deadlocks. Hand the
/// event off to another thread instead, as the channel sink does.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

impl EventSink for Sender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.send(event) {
            debug!("Dropping event, no subscriber left: {:?}", e.into_inner());
        }
    }
}
