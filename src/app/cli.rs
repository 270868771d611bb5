use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use crossbeam_channel::{bounded, select, Receiver};
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal,
};

use log::warn;
use tasker::{AppConfig, Catalog, CatalogError, EngineEvent, Task, TaskManager};

const PROMPT: &str = ">>> ";

type Input = Arc<Mutex<String>>;

pub fn run_cli(manager: &TaskManager, mut catalog: Catalog, config: &AppConfig) -> io::Result<()> {
    println!("Task runner started. Enter a command, 'help' for the list, or 'exit' to quit.");
    let input: Input = Arc::new(Mutex::new(String::new()));
    let (done_tx, done_rx) = bounded::<()>(0);
    let printer = spawn_event_printer(manager.subscribe(), done_rx, Arc::clone(&input));

    let mut commands_history: Vec<String> = Vec::new();
    let mut history_index = 0;

    terminal::enable_raw_mode()?;
    let result = (|| -> io::Result<()> {
        loop {
            let line = match read_line(&input, &commands_history, &mut history_index)? {
                Some(line) => line,
                None => break,
            };
            if !line.trim().is_empty() {
                commands_history.push(line.clone());
            }
            history_index = commands_history.len();

            if !execute_command(&line, manager, &mut catalog, config) {
                break;
            }
        }
        Ok(())
    })();
    terminal::disable_raw_mode()?;

    drop(done_tx);
    if printer.join().is_err() {
        warn!("Event printer panicked.");
    }
    result
}

/// Reads one line with history navigation. `None` on Ctrl-C / Ctrl-D.
fn read_line(input: &Input, history: &[String], history_index: &mut usize) -> io::Result<Option<String>> {
    set_input(input, String::new())?;
    loop {
        let Event::Key(key_event) = event::read()? else { continue };
        if key_event.kind != KeyEventKind::Press {
            continue;
        }
        match key_event.code {
            KeyCode::Enter => {
                print!("\r\n");
                io::stdout().flush()?;
                let line = std::mem::take(&mut *lock(input));
                return Ok(Some(line));
            }
            KeyCode::Char('c') | KeyCode::Char('d') if key_event.modifiers.contains(KeyModifiers::CONTROL) => {
                print!("\r\n");
                return Ok(None);
            }
            KeyCode::Up => {
                if *history_index > 0 {
                    *history_index -= 1;
                }
                if let Some(command) = history.get(*history_index) {
                    set_input(input, command.clone())?;
                }
            }
            KeyCode::Down => {
                if *history_index < history.len() {
                    *history_index += 1;
                }
                let command = history.get(*history_index).cloned().unwrap_or_default();
                set_input(input, command)?;
            }
            KeyCode::Char(c) => {
                lock(input).push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                let current = {
                    let mut guard = lock(input);
                    guard.pop();
                    guard.clone()
                };
                set_input(input, current)?;
            }
            _ => {}
        }
    }
}

fn lock(input: &Input) -> std::sync::MutexGuard<'_, String> {
    input.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn set_input(input: &Input, value: String) -> io::Result<()> {
    let mut guard = lock(input);
    *guard = value;
    redraw(&guard)
}

fn redraw(current: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    execute!(stdout, cursor::MoveToColumn(0), terminal::Clear(terminal::ClearType::CurrentLine))?;
    print!("{}{}", PROMPT, current);
    stdout.flush()
}

/// Prints engine events above the prompt, then restores what the user was typing.
fn spawn_event_printer(events: Receiver<EngineEvent>, done: Receiver<()>, input: Input) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => {
                    let guard = lock(&input);
                    if let Err(e) = execute!(io::stdout(), cursor::MoveToColumn(0), terminal::Clear(terminal::ClearType::CurrentLine)) {
                        warn!("Failed to clear the prompt line: {}", e);
                    }
                    for line in describe(&event) {
                        print!("\r{}\r\n", line);
                    }
                    if let Err(e) = redraw(&guard) {
                        warn!("Failed to redraw the prompt: {}", e);
                    }
                }
                Err(_) => break,
            },
            recv(done) -> _ => break,
        }
    })
}

fn describe(event: &EngineEvent) -> Vec<String> {
    let short = short_id(event.task_id());
    match event {
        EngineEvent::StatusChanged { running: true, .. } => vec![format!("[{}] started", short)],
        EngineEvent::StatusChanged { running: false, .. } => vec![format!("[{}] no longer running", short)],
        EngineEvent::OutputReceived { stream, text, .. } => {
            text.lines().map(|line| format!("[{} {}] {}", short, stream, line)).collect()
        }
        EngineEvent::StartFailed { reason, .. } => vec![format!("[{}] failed to start: {}", short, reason)],
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Splits `create` arguments into the working directory and the command.
/// `--dir <dir>` overrides `default_dir`.
fn parse_create(rest: &[&str], default_dir: &Path) -> Option<(PathBuf, String)> {
    let (dir, words) = match rest {
        ["--dir", dir, words @ ..] => (PathBuf::from(dir), words),
        words => (default_dir.to_path_buf(), words),
    };
    if words.is_empty() {
        return None;
    }
    Some((dir, words.join(" ")))
}

/// Runs one command line. Returns `false` when the session should end.
///
/// Starting and stopping are queued to the engine so the prompt never waits
/// out a grace period; the event printer reports how they went.
fn execute_command(line: &str, manager: &TaskManager, catalog: &mut Catalog, config: &AppConfig) -> bool {
    let mut args = line.split_whitespace();
    let command = args.next();
    let rest: Vec<&str> = args.collect();
    let catalog_path = config.catalog_path.as_path();

    let outcome: Result<(), CatalogError> = match command {
        Some("create") => match parse_create(&rest, &config.default_dir) {
            Some((dir, cmd)) => catalog.add_task(&dir, &cmd, None).and_then(|task| {
                say(&format!("Created task with ID: {} in {}", task.id, dir.display()));
                catalog.save(catalog_path)
            }),
            None => {
                say("Usage: create [--dir <dir>] <command...>");
                Ok(())
            }
        },
        Some("rename") => match rest.split_first() {
            Some((id, words)) if !words.is_empty() => catalog.resolve(id).cloned().and_then(|task| {
                let title = words.join(" ");
                catalog.update_task(&task.id, &task.working_dir, &task.command, Some(title.as_str()))?;
                say(&format!("Renamed task {}", short_id(&task.id)));
                catalog.save(catalog_path)
            }),
            _ => {
                say("Usage: rename <id> <title...>");
                Ok(())
            }
        },
        Some("run") => with_task(catalog, rest.first(), |task| {
            say(&format!("Starting: {}", task.title));
            manager.start_async(task.clone());
        }),
        Some("stop") => with_task(catalog, rest.first(), |task| {
            if request_stop(manager, task) {
                say(&format!("Stopping: {}", task.title));
            } else {
                say(&format!("Task {} is not running", task.title));
            }
        }),
        Some("delete") => match rest.first() {
            Some(id) => catalog.resolve(id).map(|task| task.id.clone()).and_then(|id| {
                if let Some(task) = catalog.remove_task(&id) {
                    request_stop(manager, &task);
                    say(&format!("Deleted task: {}", task.title));
                }
                catalog.save(catalog_path)
            }),
            None => {
                say("Task ID must be specified.");
                Ok(())
            }
        },
        Some("group") => match rest.split_first() {
            Some((name, ids)) if !ids.is_empty() => ids
                .iter()
                .map(|id| catalog.resolve(id).map(|task| task.id.clone()))
                .collect::<Result<Vec<String>, _>>()
                .and_then(|ids| {
                    let count = catalog.create_group(name, &ids)?.len();
                    say(&format!("Created group: {} with {} tasks", name, count));
                    catalog.save(catalog_path)
                }),
            _ => {
                say("Usage: group <name> <id> [<id>...]");
                Ok(())
            }
        },
        Some("rungroup") => with_group(catalog, rest.first(), |tasks| {
            for task in tasks {
                manager.start_async(task.clone());
            }
            say(&format!("Starting {} task(s)", tasks.len()));
        }),
        Some("stopgroup") => with_group(catalog, rest.first(), |tasks| {
            let stopping = tasks.iter().filter(|task| request_stop(manager, task)).count();
            say(&format!("Stopping {} task(s)", stopping));
        }),
        Some("ungroup") => match rest.first() {
            Some(name) => catalog.dissolve_group(name).and_then(|_| {
                say(&format!("Deleted group: {}", name));
                catalog.save(catalog_path)
            }),
            None => {
                say("Group name must be specified.");
                Ok(())
            }
        },
        Some("list") => {
            print_tasks(manager, catalog);
            Ok(())
        }
        Some("status") => with_task(catalog, rest.first(), |task| {
            let state = if manager.is_running(&task.id) { "running" } else { "not running" };
            say(&format!("Task {} status: {}", task.title, state));
        }),
        Some("ps") => {
            let running = manager.running_tasks();
            if running.is_empty() {
                say("No running tasks");
            }
            for info in running {
                say(&format!(
                    "{}\t{}\t{:?}\t{}s\t{}",
                    short_id(&info.task_id),
                    info.pid,
                    info.state,
                    info.uptime.as_secs(),
                    info.title
                ));
            }
            Ok(())
        }
        Some("help") => {
            for usage in [
                "create [--dir <dir>] <command...>",
                "rename <id> <title...>",
                "run <id> | stop <id> | status <id> | delete <id>",
                "group <name> <id>... | rungroup <name> | stopgroup <name> | ungroup <name>",
                "list | ps | exit",
            ] {
                say(usage);
            }
            Ok(())
        }
        Some("exit") => {
            say("Exiting the program...");
            return false;
        }
        Some(cmd) => {
            say(&format!("Unknown command: {}. Please try again.", cmd));
            Ok(())
        }
        None => Ok(()),
    };

    if let Err(e) = outcome {
        say(&format!("Error: {}", e));
    }
    true
}

/// Queues a stop if the task runs. Returns whether one was queued.
fn request_stop(manager: &TaskManager, task: &Task) -> bool {
    let running = manager.is_running(&task.id);
    if running {
        manager.stop_async(&task.id);
    }
    running
}

fn with_task(catalog: &Catalog, id: Option<&&str>, action: impl FnOnce(&Task)) -> Result<(), CatalogError> {
    match id {
        Some(id) => catalog.resolve(id).map(action),
        None => {
            say("Task ID must be specified.");
            Ok(())
        }
    }
}

fn with_group(catalog: &Catalog, name: Option<&&str>, action: impl FnOnce(&[Task])) -> Result<(), CatalogError> {
    match name {
        Some(name) => catalog.group(name).map(action),
        None => {
            say("Group name must be specified.");
            Ok(())
        }
    }
}

fn print_tasks(manager: &TaskManager, catalog: &Catalog) {
    if catalog.all_tasks().next().is_none() {
        say("No tasks defined");
        return;
    }
    say(&format!("{}\t {} \t {} \t {}", "ID", "Status", "Directory", "Command"));
    say(&"-".repeat(60));
    let row = |task: &Task| {
        let status = if manager.is_running(&task.id) { "running" } else { "idle" };
        say(&format!("{}\t {} \t {} \t {}", short_id(&task.id), status, task.working_dir.display(), task.command));
    };
    catalog.tasks.iter().for_each(row);
    for (name, tasks) in &catalog.groups {
        say(&format!("Group: {}", name));
        tasks.iter().for_each(row);
    }
}

fn say(message: &str) {
    print!("\r{}\r\n", message);
}
