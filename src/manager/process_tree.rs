use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt, io,
    process::Child,
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use sysinfo::{Pid, ProcessStatus, System};

/// Interval between liveness checks while waiting out the grace period.
pub const GRACE_POLL_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Terminate => f.write_str("SIGTERM"),
            Signal::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// A snapshot of the OS process table.
pub struct ProcessTable {
    system: System,
}

impl ProcessTable {
    pub fn capture() -> Self {
        let mut system = System::new();
        system.refresh_processes();
        Self { system }
    }

    /// Every process below any of `roots`, parents before children.
    pub fn descendants(&self, roots: &[u32]) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent.as_u32()).or_default().push(pid.as_u32());
            }
        }

        let mut seen: HashSet<u32> = roots.iter().copied().collect();
        let mut queue: VecDeque<u32> = roots.iter().copied().collect();
        let mut found = Vec::new();
        while let Some(pid) = queue.pop_front() {
            for &child in children.get(&pid).into_iter().flatten() {
                if seen.insert(child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Zombies count as gone: they have exited and only wait to be reaped.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.system
            .process(Pid::from_u32(pid))
            .map(|process| process.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct SignalFailure {
    pub pid: u32,
    pub signal: Signal,
    pub error: io::Error,
}

/// Outcome of tearing down a process tree. Failures never abort the teardown.
#[derive(Debug, Default)]
pub struct TerminationReport {
    pub signalled: Vec<u32>,
    pub forced: Vec<u32>,
    pub failures: Vec<SignalFailure>,
}

impl TerminationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, pid: u32, signal: Signal, result: io::Result<bool>) {
        match result {
            Ok(true) => match signal {
                Signal::Terminate => self.signalled.push(pid),
                Signal::Kill => self.forced.push(pid),
            },
            Ok(false) => debug!("Process {} already gone before {}.", pid, signal),
            Err(error) => self.failures.push(SignalFailure { pid, signal, error }),
        }
    }
}

/// Delivers a signal to one pid, with the contract of [`send_signal`].
pub type SignalFn = fn(u32, Signal) -> io::Result<bool>;

/// Sends `signal` to `pid`. `Ok(false)` means the process no longer exists.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<bool> {
    let raw = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, raw) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<bool> {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return Ok(false);
    }
    let Some(process) = system.process(pid) else {
        return Ok(false);
    };
    let delivered = match signal {
        Signal::Terminate => process.kill_with(sysinfo::Signal::Term).unwrap_or_else(|| process.kill()),
        Signal::Kill => process.kill(),
    };
    if delivered {
        Ok(true)
    } else {
        Err(io::Error::new(io::ErrorKind::Other, format!("{} was not delivered", signal)))
    }
}

fn has_exited(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(status) => status.is_some(),
        Err(e) => {
            warn!("Failed to query process {}: {}", child.id(), e);
            true
        }
    }
}

/// Two-phase teardown of `child` and everything it spawned.
///
/// Descendants get SIGTERM deepest first, then the root. Whatever is still
/// alive after `grace` (including processes forked in the meantime) gets
/// SIGKILL. The root is always reaped before returning, whatever `signal`
/// failed to deliver along the way.
pub fn terminate_tree(child: &mut Child, grace: Duration, signal: SignalFn) -> TerminationReport {
    let root = child.id();
    let mut report = TerminationReport::default();
    let mut tree = ProcessTable::capture().descendants(&[root]);
    debug!("Terminating process {} with {} descendant(s).", root, tree.len());

    for &pid in tree.iter().rev() {
        report.record(pid, Signal::Terminate, signal(pid, Signal::Terminate));
    }
    if !has_exited(child) {
        report.record(root, Signal::Terminate, signal(root, Signal::Terminate));
    }

    let deadline = Instant::now() + grace;
    loop {
        let root_gone = has_exited(child);
        let table = ProcessTable::capture();
        tree.retain(|pid| table.is_alive(*pid));
        if root_gone && tree.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            let mut roots = tree.clone();
            if !root_gone {
                roots.push(root);
            }
            for pid in table.descendants(&roots) {
                if !tree.contains(&pid) {
                    tree.push(pid);
                }
            }
            for &pid in tree.iter().rev() {
                report.record(pid, Signal::Kill, signal(pid, Signal::Kill));
            }
            if !root_gone {
                let result = child.kill().map(|_| true);
                report.record(root, Signal::Kill, result);
            }
            break;
        }
        thread::sleep(GRACE_POLL_STEP);
    }

    if let Err(e) = child.wait() {
        warn!("Failed to reap process {}: {}", root, e);
    }
    report
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::{Command, Stdio};

    use super::*;

    fn spawn(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn wait_for_descendants(root: u32, count: usize) -> Vec<u32> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = ProcessTable::capture().descendants(&[root]);
            if found.len() >= count || Instant::now() >= deadline {
                return found;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn finds_nested_descendants() {
        let mut child = spawn("sh -c 'sleep 30; true' & sleep 30 & wait");
        let found = wait_for_descendants(child.id(), 3);
        assert!(found.len() >= 3, "found only {:?}", found);

        let report = terminate_tree(&mut child, Duration::from_secs(2), send_signal);
        assert!(report.is_complete(), "{:?}", report.failures);
        let table = ProcessTable::capture();
        for pid in found {
            assert!(!table.is_alive(pid), "process {} survived", pid);
        }
    }

    #[test]
    fn escalates_to_kill_when_term_is_ignored() {
        let mut child = spawn("trap '' TERM; sleep 30 & wait");
        let found = wait_for_descendants(child.id(), 1);
        let started = Instant::now();

        let report = terminate_tree(&mut child, Duration::from_millis(300), send_signal);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(report.forced.contains(&child.id()));
        let table = ProcessTable::capture();
        assert!(!table.is_alive(child.id()));
        for pid in found {
            assert!(!table.is_alive(pid));
        }
    }

    #[test]
    fn signalling_missing_process_is_not_an_error() {
        let mut child = spawn("exit 0");
        let pid = child.id();
        child.wait().unwrap();
        assert!(!send_signal(pid, Signal::Terminate).unwrap());
    }

    #[test]
    fn terminating_exited_process_reports_nothing() {
        let mut child = spawn("exit 3");
        thread::sleep(Duration::from_millis(200));
        let report = terminate_tree(&mut child, Duration::from_millis(200), send_signal);
        assert!(report.is_complete());
        assert!(report.forced.is_empty());
    }

    fn refuse_terminate(pid: u32, signal: Signal) -> io::Result<bool> {
        match signal {
            Signal::Terminate => Err(io::Error::from_raw_os_error(libc::EPERM)),
            Signal::Kill => send_signal(pid, signal),
        }
    }

    #[test]
    fn undeliverable_term_is_reported_and_root_still_reaped() {
        let mut child = spawn("sleep 30");
        let report = terminate_tree(&mut child, Duration::from_millis(200), refuse_terminate);

        assert!(!report.is_complete());
        assert!(report
            .failures
            .iter()
            .any(|failure| failure.pid == child.id() && failure.signal == Signal::Terminate));
        assert!(report.forced.contains(&child.id()));
        assert!(child.try_wait().unwrap().is_some());
    }
}
