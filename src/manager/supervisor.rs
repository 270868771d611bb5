use std::{
    collections::HashMap,
    process::{Child, ExitStatus, Stdio},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};

use crate::config::{EngineConfig, LaunchMode};
use crate::error::EngineError;
use crate::models::{
    message::{EngineEvent, EventSink},
    task::{StreamKind, Task, TaskState},
};
use crate::worker::{
    launcher,
    relay::{self, RelaySettings},
};
use super::process_tree::{self, SignalFn, TerminationReport};

/// Bookkeeping for one task that has a live (or not yet reaped) process.
struct RunningTask {
    title: String,
    child: Option<Child>,
    pid: u32,
    started_at: Instant,
    state: TaskState,
    drained: Option<Receiver<()>>,
}

impl RunningTask {
    fn reserved(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            child: None,
            pid: 0,
            started_at: Instant::now(),
            state: TaskState::Starting,
            drained: None,
        }
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.state != TaskState::Running {
            return None;
        }
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to query process {}: {}", self.pid, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub task_id: String,
    pub pid: u32,
}

#[derive(Debug)]
pub struct Stopped {
    pub task_id: String,
    pub report: TerminationReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Exited(ExitStatus),
    StillRunning,
    NotTracked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInfo {
    pub task_id: String,
    pub title: String,
    pub pid: u32,
    pub state: TaskState,
    pub uptime: Duration,
}

/// Owns every running task. All inserts and purges happen under `running`;
/// spawning, termination and draining run outside it while the record is
/// held in `Starting` or `Stopping`.
pub struct Supervisor {
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    running: Mutex<HashMap<String, RunningTask>>,
    settled: Condvar,
    signal: SignalFn,
}

impl Supervisor {
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            running: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            signal: process_tree::send_signal,
        }
    }

    /// Replaces how teardown delivers signals.
    pub fn with_signal(mut self, signal: SignalFn) -> Self {
        self.signal = signal;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, RunningTask>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until no start or stop is in flight for `task_id`.
    fn settled_registry(&self, task_id: &str) -> MutexGuard<'_, HashMap<String, RunningTask>> {
        let guard = self.registry();
        self.settled
            .wait_while(guard, |running| {
                running
                    .get(task_id)
                    .map_or(false, |record| record.state != TaskState::Running)
            })
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, task: &Task) -> Result<Started, EngineError> {
        if self.reap(&task.id).is_some() {
            debug!("Purged stale record of task '{}' before restart.", task.id);
        }
        {
            let mut running = self.registry();
            if running.contains_key(&task.id) {
                info!("Task '{}' is already running.", task.title);
                return Err(EngineError::AlreadyRunning(task.id.clone()));
            }
            if running.len() >= self.config.max_tasks {
                return Err(EngineError::TooManyTasks {
                    task_id: task.id.clone(),
                    limit: self.config.max_tasks,
                });
            }
            running.insert(task.id.clone(), RunningTask::reserved(task));
        }

        let spec = launcher::build(&task.working_dir, &task.command);
        info!("Executing '{}' in {}.", task.command, spec.working_dir.display());
        let mut command = spec.command();
        command.stdin(Stdio::null());
        match self.config.launch_mode {
            LaunchMode::Captured => command.stdout(Stdio::piped()).stderr(Stdio::piped()),
            LaunchMode::Detached => command.stdout(Stdio::null()).stderr(Stdio::null()),
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!("Error running '{}': {}", task.title, source);
                self.registry().remove(&task.id);
                self.settled.notify_all();
                return Err(EngineError::LaunchFailed {
                    task_id: task.id.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (drained_tx, drained_rx) = bounded::<()>(1);

        let mut running = self.registry();
        if let Some(record) = running.get_mut(&task.id) {
            record.child = Some(child);
            record.pid = pid;
            record.started_at = Instant::now();
            record.state = TaskState::Running;
            record.drained = Some(drained_rx);
        }
        self.sink.emit(EngineEvent::StatusChanged {
            task_id: task.id.clone(),
            running: true,
        });

        let settings = RelaySettings {
            batch_lines: self.config.batch_lines,
            flush_interval: self.config.flush_interval,
            format: self.config.output_format,
        };
        let streams = [
            (StreamKind::Stdout, stdout.map(|s| Box::new(s) as Box<dyn std::io::Read + Send>)),
            (StreamKind::Stderr, stderr.map(|s| Box::new(s) as Box<dyn std::io::Read + Send>)),
        ];
        for (kind, stream) in streams {
            let Some(stream) = stream else { continue };
            if let Err(e) = relay::attach(stream, kind, task.id.clone(), Arc::clone(&self.sink), settings, drained_tx.clone()) {
                warn!("Failed to start {} relay for task '{}': {}", kind, task.id, e);
            }
        }
        drop(drained_tx);
        drop(running);
        self.settled.notify_all();

        info!("Task '{}' started with pid {}.", task.title, pid);
        Ok(Started {
            task_id: task.id.clone(),
            pid,
        })
    }

    /// Non-blocking exit check.
    pub fn poll(&self, task_id: &str) -> PollStatus {
        let mut running = self.registry();
        match running.get_mut(task_id) {
            None => PollStatus::NotTracked,
            Some(record) => match record.exit_status() {
                Some(status) => PollStatus::Exited(status),
                None => PollStatus::StillRunning,
            },
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        matches!(self.poll(task_id), PollStatus::StillRunning)
    }

    /// Purges a task whose process exited on its own. No signals are sent.
    pub fn reap(&self, task_id: &str) -> Option<ExitStatus> {
        let (drained, title, status) = {
            let mut running = self.registry();
            let record = running.get_mut(task_id)?;
            let status = record.exit_status()?;
            record.state = TaskState::Stopping;
            (record.drained.take(), record.title.clone(), status)
        };
        info!("Task '{}' exited with {}.", title, status);
        self.purge(task_id, drained, true);
        Some(status)
    }

    pub fn stop(&self, task_id: &str) -> Result<Stopped, EngineError> {
        let (mut child, drained, title) = {
            let mut running = self.settled_registry(task_id);
            let record = running
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotTracked(task_id.to_string()))?;
            let child = record
                .child
                .take()
                .ok_or_else(|| EngineError::NotTracked(task_id.to_string()))?;
            record.state = TaskState::Stopping;
            (child, record.drained.take(), record.title.clone())
        };

        let report = process_tree::terminate_tree(&mut child, self.config.grace_period, self.signal);
        if !report.is_complete() {
            for failure in &report.failures {
                warn!(
                    "Could not deliver {} to process {} of task '{}': {}",
                    failure.signal, failure.pid, title, failure.error
                );
            }
        }

        self.purge(task_id, drained, false);
        info!("Task '{}' stopped.", title);
        Ok(Stopped {
            task_id: task_id.to_string(),
            report,
        })
    }

    /// Stops every tracked task and returns what was stopped.
    pub fn stop_all(&self) -> Vec<Stopped> {
        self.tracked_ids()
            .iter()
            .filter_map(|task_id| self.stop(task_id).ok())
            .collect()
    }

    /// Ids of records in `Running` state, taken as one stable snapshot.
    pub fn tracked_ids(&self) -> Vec<String> {
        self.registry()
            .iter()
            .filter(|(_, record)| record.state == TaskState::Running)
            .map(|(task_id, _)| task_id.clone())
            .collect()
    }

    pub fn running_tasks(&self) -> Vec<RunningInfo> {
        let mut tasks: Vec<RunningInfo> = self
            .registry()
            .iter()
            .map(|(task_id, record)| RunningInfo {
                task_id: task_id.clone(),
                title: record.title.clone(),
                pid: record.pid,
                state: record.state,
                uptime: record.started_at.elapsed(),
            })
            .collect();
        tasks.sort_by(|a, b| b.uptime.cmp(&a.uptime));
        tasks
    }

    /// Lets the relays drain, then removes the record and reports the task
    /// as stopped under the same lock, so a restart can never overtake it.
    fn purge(&self, task_id: &str, drained: Option<Receiver<()>>, natural: bool) {
        if let Some(drained) = drained {
            match drained.recv_timeout(self.config.drain_timeout) {
                Err(RecvTimeoutError::Disconnected) | Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Output of task '{}' still open after its process ended.", task_id)
                }
            }
        }
        let mut running = self.registry();
        running.remove(task_id);
        debug!("Purged task '{}' ({}).", task_id, if natural { "exited" } else { "terminated" });
        self.sink.emit(EngineEvent::StatusChanged {
            task_id: task_id.to_string(),
            running: false,
        });
        drop(running);
        self.settled.notify_all();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::thread;

    use crossbeam_channel::unbounded;

    use super::*;

    fn supervisor() -> (Arc<Supervisor>, Receiver<EngineEvent>) {
        let (tx, rx) = unbounded();
        let config = EngineConfig {
            grace_period: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        (Arc::new(Supervisor::new(config, Arc::new(tx))), rx)
    }

    fn task(id: &str, command: &str) -> Task {
        Task::new(id, id, "/tmp", command)
    }

    fn reap_when_exited(supervisor: &Supervisor, task_id: &str) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let PollStatus::Exited(_) = supervisor.poll(task_id) {
                return supervisor.reap(task_id).unwrap();
            }
            assert!(Instant::now() < deadline, "task '{}' never exited", task_id);
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn echo_task_runs_to_completion() {
        let (supervisor, events) = supervisor();
        let started = supervisor.start(&task("t1", "echo hello")).unwrap();
        assert_eq!(started.task_id, "t1");

        let status = reap_when_exited(&supervisor, "t1");
        assert!(status.success());
        assert_eq!(supervisor.poll("t1"), PollStatus::NotTracked);

        let received: Vec<EngineEvent> = events.try_iter().collect();
        let expected = vec![
            EngineEvent::StatusChanged { task_id: "t1".into(), running: true },
            EngineEvent::OutputReceived {
                task_id: "t1".into(),
                stream: StreamKind::Stdout,
                text: "hello".into(),
            },
            EngineEvent::StatusChanged { task_id: "t1".into(), running: false },
        ];
        assert_eq!(received, expected);
    }

    #[test]
    fn second_start_is_rejected_and_stop_is_idempotent() {
        let (supervisor, _events) = supervisor();
        let t2 = task("t2", "sleep 100");
        supervisor.start(&t2).unwrap();
        assert!(matches!(supervisor.start(&t2), Err(EngineError::AlreadyRunning(_))));

        let begun = Instant::now();
        let stopped = supervisor.stop("t2").unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert_eq!(stopped.task_id, "t2");
        assert!(matches!(supervisor.stop("t2"), Err(EngineError::NotTracked(_))));
        assert!(!supervisor.is_running("t2"));
    }

    #[test]
    fn concurrent_stops_yield_one_stopped() {
        let (supervisor, _events) = supervisor();
        supervisor.start(&task("x", "trap '' TERM; sleep 30 & wait")).unwrap();
        thread::sleep(Duration::from_millis(100));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                thread::spawn(move || supervisor.stop("x"))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(EngineError::NotTracked(_))))
                .count(),
            3
        );
        assert!(supervisor.running_tasks().is_empty());
    }

    fn refuse_terminate(pid: u32, signal: process_tree::Signal) -> std::io::Result<bool> {
        match signal {
            process_tree::Signal::Terminate => Err(std::io::Error::from_raw_os_error(libc::EPERM)),
            process_tree::Signal::Kill => process_tree::send_signal(pid, signal),
        }
    }

    #[test]
    fn undeliverable_signals_still_purge_the_record() {
        let (tx, events) = unbounded();
        let config = EngineConfig {
            grace_period: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        let supervisor = Supervisor::new(config, Arc::new(tx)).with_signal(refuse_terminate);
        let started = supervisor.start(&task("stubborn", "sleep 30")).unwrap();

        let stopped = supervisor.stop("stubborn").unwrap();
        assert!(!stopped.report.is_complete());
        assert!(stopped.report.failures.iter().any(|failure| failure.pid == started.pid));
        assert_eq!(supervisor.poll("stubborn"), PollStatus::NotTracked);
        assert!(!process_tree::ProcessTable::capture().is_alive(started.pid));

        let stops = events
            .try_iter()
            .filter(|event| matches!(event, EngineEvent::StatusChanged { running: false, .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn launch_failure_leaves_no_record() {
        let (supervisor, events) = supervisor();
        let bad = Task::new("bad", "bad", "/definitely/not/a/dir", "echo hi");
        match supervisor.start(&bad) {
            Err(EngineError::LaunchFailed { task_id, .. }) => assert_eq!(task_id, "bad"),
            other => panic!("expected launch failure, got {:?}", other),
        }
        assert_eq!(supervisor.poll("bad"), PollStatus::NotTracked);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn concurrent_starts_create_one_record() {
        let (supervisor, _events) = supervisor();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                thread::spawn(move || supervisor.start(&task("race", "sleep 30")))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::AlreadyRunning(_))));
        assert_eq!(supervisor.running_tasks().len(), 1);
        supervisor.stop("race").unwrap();
    }

    #[test]
    fn status_false_arrives_after_purge() {
        let (supervisor, events) = supervisor();
        supervisor.start(&task("t3", "sleep 30")).unwrap();
        let watcher = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || {
                for event in events.iter() {
                    if let EngineEvent::StatusChanged { running: false, .. } = event {
                        return supervisor.poll("t3");
                    }
                }
                PollStatus::StillRunning
            })
        };
        supervisor.stop("t3").unwrap();
        drop(supervisor);
        assert_eq!(watcher.join().unwrap(), PollStatus::NotTracked);
    }

    #[test]
    fn fast_exit_keeps_all_output() {
        let (supervisor, events) = supervisor();
        supervisor.start(&task("seq", "i=1; while [ $i -le 23 ]; do echo line $i; i=$((i+1)); done")).unwrap();
        reap_when_exited(&supervisor, "seq");

        let mut lines = Vec::new();
        let mut saw_stop = false;
        for event in events.try_iter() {
            match event {
                EngineEvent::OutputReceived { text, .. } => {
                    assert!(!saw_stop, "output after StatusChanged(false)");
                    lines.extend(text.lines().map(str::to_string));
                }
                EngineEvent::StatusChanged { running: false, .. } => saw_stop = true,
                _ => {}
            }
        }
        assert!(saw_stop);
        assert_eq!(lines.len(), 23);
        assert_eq!(lines.last().map(String::as_str), Some("line 23"));
    }

    #[test]
    fn stop_kills_descendants() {
        let (supervisor, _events) = supervisor();
        let started = supervisor
            .start(&task("tree", "sh -c 'sleep 60; true' & sleep 60; true"))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let descendants = loop {
            let found = process_tree::ProcessTable::capture().descendants(&[started.pid]);
            if found.len() >= 3 || Instant::now() >= deadline {
                break found;
            }
            thread::sleep(Duration::from_millis(20));
        };
        assert!(descendants.len() >= 3, "found {:?}", descendants);

        supervisor.stop("tree").unwrap();
        let table = process_tree::ProcessTable::capture();
        assert!(!table.is_alive(started.pid));
        for pid in descendants {
            assert!(!table.is_alive(pid), "descendant {} survived", pid);
        }
    }

    #[test]
    fn restart_purges_stale_exited_record() {
        let (supervisor, events) = supervisor();
        let quick = task("quick", "true");
        supervisor.start(&quick).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !matches!(supervisor.poll("quick"), PollStatus::Exited(_)) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(20));
        }

        supervisor.start(&quick).unwrap();
        let statuses: Vec<bool> = events
            .try_iter()
            .filter_map(|event| match event {
                EngineEvent::StatusChanged { running, .. } => Some(running),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![true, false, true]);
        reap_when_exited(&supervisor, "quick");
    }

    #[test]
    fn enforces_task_ceiling() {
        let (tx, _rx) = unbounded();
        let config = EngineConfig {
            max_tasks: 1,
            grace_period: Duration::from_millis(200),
            ..EngineConfig::default()
        };
        let supervisor = Supervisor::new(config, Arc::new(tx));
        supervisor.start(&task("a", "sleep 30")).unwrap();
        assert!(matches!(
            supervisor.start(&task("b", "sleep 30")),
            Err(EngineError::TooManyTasks { limit: 1, .. })
        ));
        assert_eq!(supervisor.stop_all().len(), 1);
        assert!(supervisor.running_tasks().is_empty());
    }

    #[test]
    fn detached_mode_relays_nothing() {
        let (tx, rx) = unbounded();
        let config = EngineConfig {
            launch_mode: LaunchMode::Detached,
            ..EngineConfig::default()
        };
        let supervisor = Supervisor::new(config, Arc::new(tx));
        supervisor.start(&Task::new("d", "d", Path::new("/tmp"), "echo hidden")).unwrap();
        reap_when_exited(&supervisor, "d");
        assert!(rx.try_iter().all(|event| !matches!(event, EngineEvent::OutputReceived { .. })));
    }
}
