use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::Receiver;
use log::{error, info};

use crate::error::EngineError;
use crate::manager::supervisor::{Started, Supervisor};
use crate::models::message::{EngineCommand, EngineEvent, EventSink};

/// Spawns the thread serving `start_async` / `stop_async` requests.
pub fn spawn_worker_thread(
    receiver: Receiver<EngineCommand>,
    supervisor: Arc<Supervisor>,
    sink: Arc<dyn EventSink>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("command-worker".to_string()).spawn(move || loop {
        match receiver.recv() {
            Ok(message) => match message {
                EngineCommand::Start(task) => handle_start(&task.id, supervisor.start(&task), sink.as_ref()),
                EngineCommand::Stop(id) => {
                    if let Err(e) = supervisor.stop(&id) {
                        info!("Stop request ignored: {}", e);
                    }
                }
                EngineCommand::StopAll => {
                    let stopped = supervisor.stop_all();
                    info!("Stopped {} task(s).", stopped.len());
                }
                EngineCommand::Shutdown => break,
            },
            Err(e) => {
                error!("Failed to receive message: {}", e);
                break;
            }
        }
    })
}

fn handle_start(task_id: &str, result: Result<Started, EngineError>, sink: &dyn EventSink) {
    if let Err(e) = result {
        sink.emit(EngineEvent::StartFailed {
            task_id: task_id.to_string(),
            reason: e.to_string(),
        });
    }
}
