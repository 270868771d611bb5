use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};

use crate::manager::supervisor::{PollStatus, Supervisor};

/// Spawns the loop that notices tasks exiting on their own.
///
/// Runs until `shutdown` receives a message or its sender is dropped.
pub fn spawn_poller(supervisor: Arc<Supervisor>, interval: Duration, shutdown: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("status-poller".to_string()).spawn(move || loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let purged = tick(&supervisor);
                if purged > 0 {
                    debug!("Status poller purged {} task(s).", purged);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Status poller shutting down.");
                break;
            }
        }
    })
}

/// One pass over a snapshot of tracked ids. Returns how many tasks were purged.
pub fn tick(supervisor: &Supervisor) -> usize {
    let mut purged = 0;
    for task_id in supervisor.tracked_ids() {
        if let PollStatus::Exited(_) = supervisor.poll(&task_id) {
            // reap re-checks under the lock, a concurrent stop wins cleanly
            if supervisor.reap(&task_id).is_some() {
                info!("Task {} is no longer running.", task_id);
                purged += 1;
            }
        }
    }
    purged
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use crossbeam_channel::{bounded, unbounded};

    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{message::EngineEvent, task::Task};

    #[test]
    fn tick_purges_only_exited_tasks() {
        let (tx, rx) = unbounded();
        let supervisor = Supervisor::new(EngineConfig::default(), Arc::new(tx));
        supervisor.start(&Task::new("done", "done", "/tmp", "true")).unwrap();
        supervisor.start(&Task::new("busy", "busy", "/tmp", "sleep 30")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut purged = 0;
        while purged == 0 && Instant::now() < deadline {
            purged = tick(&supervisor);
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(purged, 1);
        assert!(!supervisor.is_running("done"));
        assert!(supervisor.is_running("busy"));
        assert!(rx.try_iter().any(|e| e == EngineEvent::StatusChanged { task_id: "done".into(), running: false }));
        supervisor.stop("busy").unwrap();
    }

    #[test]
    fn poller_thread_purges_exited_task() {
        let (tx, rx) = unbounded();
        let supervisor = Arc::new(Supervisor::new(EngineConfig::default(), Arc::new(tx)));
        supervisor.start(&Task::new("quick", "quick", "/tmp", "true")).unwrap();
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = spawn_poller(Arc::clone(&supervisor), Duration::from_millis(20), shutdown_rx).unwrap();

        let stopped = EngineEvent::StatusChanged { task_id: "quick".into(), running: false };
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Ok(event) = rx.recv_deadline(deadline) {
            if event == stopped {
                break;
            }
        }
        assert_eq!(supervisor.poll("quick"), PollStatus::NotTracked);
        shutdown_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn poller_stops_on_shutdown() {
        let (tx, _rx) = unbounded();
        let supervisor = Arc::new(Supervisor::new(EngineConfig::default(), Arc::new(tx)));
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = spawn_poller(supervisor, Duration::from_millis(10), shutdown_rx).unwrap();
        shutdown_tx.send(()).unwrap();
        handle.join().unwrap();
    }
}
