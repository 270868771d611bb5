use std::{
    io::{self, BufRead, BufReader, Read},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::models::{
    message::{EngineEvent, EventSink},
    task::StreamKind,
};
use super::ansi::{AnsiRenderer, OutputFormat};

/// Longest run of bytes without a line break that is held back as one line.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub batch_lines: usize,
    /// How long the first line of a partial batch may wait for company.
    pub flush_interval: Duration,
    pub format: OutputFormat,
}

/// Spawns a worker that drains `stream` to EOF and forwards it to `sink`.
///
/// `drained` is dropped when the worker exits; the supervisor waits on the
/// paired receiver to know both streams of a process are fully relayed.
pub fn attach<R>(
    stream: R,
    kind: StreamKind,
    task_id: String,
    sink: Arc<dyn EventSink>,
    settings: RelaySettings,
    drained: Sender<()>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("relay-{}-{}", kind, task_id))
        .spawn(move || {
            relay(stream, kind, &task_id, sink.as_ref(), settings);
            drop(drained);
        })
}

/// Relays `stream` until EOF.
///
/// A reader thread splits the stream into lines while this thread batches
/// them: a batch goes out once it holds `batch_lines` lines or its oldest
/// line has waited `flush_interval`, and whatever is left goes out at EOF.
pub fn relay<R: Read + Send>(stream: R, kind: StreamKind, task_id: &str, sink: &dyn EventSink, settings: RelaySettings) {
    let (lines_tx, lines_rx) = unbounded();
    thread::scope(|scope| {
        let reader = thread::Builder::new()
            .name(format!("reader-{}-{}", kind, task_id))
            .spawn_scoped(scope, move || read_lines(stream, kind, task_id, lines_tx));
        if let Err(e) = reader {
            warn!("Failed to start {} reader for task '{}': {}", kind, task_id, e);
            return;
        }
        forward(lines_rx, kind, task_id, sink, settings);
    });
    debug!("Relay for {} of task '{}' reached end of stream.", kind, task_id);
}

/// Splits on `\n`, `\r\n` and a lone `\r`, so carriage-return progress
/// output is not held back. Overlong runs are cut at `MAX_LINE_BYTES`.
fn read_lines<R: Read>(stream: R, kind: StreamKind, task_id: &str, lines: Sender<Vec<u8>>) {
    let mut reader = BufReader::new(stream);
    let mut pending = Vec::new();
    let mut after_cr = false;

    loop {
        let chunk = match reader.fill_buf() {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Reading {} of task '{}' failed: {}", kind, task_id, e);
                break;
            }
        };
        for &byte in chunk {
            match byte {
                b'\n' if after_cr && pending.is_empty() => {}
                b'\n' => send_line(&lines, &mut pending),
                b'\r' if pending.is_empty() => {}
                b'\r' => send_line(&lines, &mut pending),
                _ => {
                    pending.push(byte);
                    if pending.len() >= MAX_LINE_BYTES {
                        send_line(&lines, &mut pending);
                    }
                }
            }
            after_cr = byte == b'\r';
        }
        let consumed = chunk.len();
        reader.consume(consumed);
    }

    if !pending.is_empty() {
        send_line(&lines, &mut pending);
    }
}

fn send_line(lines: &Sender<Vec<u8>>, pending: &mut Vec<u8>) {
    // the batcher only goes away once this sender is dropped
    let _ = lines.send(std::mem::take(pending));
}

fn forward(lines: Receiver<Vec<u8>>, kind: StreamKind, task_id: &str, sink: &dyn EventSink, settings: RelaySettings) {
    let batch_lines = settings.batch_lines.max(1);
    let mut renderer = AnsiRenderer::new(settings.format);
    let mut batch: Vec<String> = Vec::with_capacity(batch_lines);
    let mut deadline: Option<Instant> = None;

    loop {
        let received = match deadline {
            Some(deadline) => lines.recv_deadline(deadline),
            None => lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(line) => {
                batch.push(renderer.render_line(&String::from_utf8_lossy(&line)));
                if batch.len() >= batch_lines {
                    flush(&mut batch, kind, task_id, sink);
                    deadline = None;
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + settings.flush_interval);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&mut batch, kind, task_id, sink);
                deadline = None;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    flush(&mut batch, kind, task_id, sink);
}

fn flush(batch: &mut Vec<String>, kind: StreamKind, task_id: &str, sink: &dyn EventSink) {
    if batch.is_empty() {
        return;
    }
    sink.emit(EngineEvent::OutputReceived {
        task_id: task_id.to_string(),
        stream: kind,
        text: batch.join("\n"),
    });
    batch.clear();
}
