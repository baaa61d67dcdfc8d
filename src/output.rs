//! Multiplexed terminal output.
//!
//! One [`OutputHub`] exists per supervisor run. It owns the synchronized
//! writer to the terminal and the color palette, and produces one [`Sink`]
//! per process. A sink runs each complete child line through format
//! decoration, prepends the padded colored process name, and broadcasts the
//! result through a [`FanOut`]: the terminal plus any control-socket
//! subscribers that tail this process.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::colors::{Color, Palette, BOLD, RESET};
use crate::decorator::Decorator;
use crate::process::ProcessSpec;

/// Name under which the supervisor's own messages appear in the output.
pub const LOG_NAME: &str = "muxrun";

/// Minimum prefix width; short process names are padded up to this.
const MIN_PREFIX_LEN: usize = 8;

/// The shared, mutex-guarded terminal writer. The lock is held for a single
/// line write at a time so lines from different sinks never interleave.
pub type Terminal = Arc<Mutex<Box<dyn Write + Send>>>;

/// Produces per-process sinks writing to one synchronized terminal.
pub struct OutputHub {
    terminal: Terminal,
    palette: Palette,
    prefix_len: usize,
    colored: bool,
    sinks: Mutex<HashMap<String, Arc<Sink>>>,
}

impl OutputHub {
    /// Creates the hub for a run. The prefix width is fixed up front from
    /// the longest process name so all prefixes align.
    pub fn new(specs: &[ProcessSpec], no_color: bool, terminal: Terminal) -> Self {
        let longest = specs.iter().map(|spec| spec.name.len()).max().unwrap_or(0);
        OutputHub {
            terminal,
            palette: if no_color { Palette::monochrome() } else { Palette::colored() },
            prefix_len: longest.max(MIN_PREFIX_LEN),
            colored: !no_color,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the sink for `spec`, creating it on first use. Repeated calls
    /// with the same name return the same sink and do not advance the
    /// palette.
    pub fn sink_for(&self, spec: &ProcessSpec) -> Arc<Sink> {
        let mut sinks = self.sinks.lock();
        if let Some(sink) = sinks.get(&spec.name) {
            return Arc::clone(sink);
        }
        let color = self.palette.next();
        let sink = Arc::new(Sink {
            name: spec.name.clone(),
            prefix: self.prefix(&spec.name, color),
            decorator: Mutex::new(Decorator::new(&spec.output)),
            fan_out: FanOut::new(Arc::clone(&self.terminal)),
            log: self.log_sink(),
        });
        sinks.insert(spec.name.clone(), Arc::clone(&sink));
        sink
    }

    /// The sink for the supervisor's own diagnostic lines. White is reserved
    /// for it and never handed out by the palette.
    pub fn log_sink(&self) -> LogSink {
        let color = if self.colored { Color::White } else { Color::None };
        LogSink {
            prefix: self.prefix(LOG_NAME, color),
            terminal: Arc::clone(&self.terminal),
        }
    }

    fn prefix(&self, name: &str, color: Color) -> String {
        let padded = format!("{:<width$}", name, width = self.prefix_len);
        if color == Color::None {
            format!("{} │ ", padded)
        } else {
            format!("{}{}{}{} │ {}", RESET, BOLD, color.code(), padded, RESET)
        }
    }
}

/// Writer for the supervisor's own messages, sharing the terminal lock with
/// all process sinks.
#[derive(Clone)]
pub struct LogSink {
    prefix: String,
    terminal: Terminal,
}

impl LogSink {
    pub fn write_line(&self, message: &str) {
        let mut buf = String::new();
        for part in message.split('\n') {
            buf.push_str(&self.prefix);
            buf.push_str(part);
            buf.push('\n');
        }
        let mut w = self.terminal.lock();
        let _ = w.write_all(buf.as_bytes()).and_then(|_| w.flush());
    }
}

enum FanWriter {
    Terminal(Terminal),
    Subscriber { id: u64, tx: mpsc::UnboundedSender<String> },
}

/// An ordered collection of downstream writers for one process. A broadcast
/// succeeds if at least one writer accepted the whole line. Subscribers whose
/// channel has closed are removed during the broadcast, so a vanished client
/// never sees another write and never blocks the pipeline.
pub struct FanOut {
    writers: Mutex<Vec<FanWriter>>,
}

impl FanOut {
    fn new(terminal: Terminal) -> Self {
        FanOut { writers: Mutex::new(vec![FanWriter::Terminal(terminal)]) }
    }

    pub fn add_subscriber(&self, id: u64, tx: mpsc::UnboundedSender<String>) {
        self.writers.lock().push(FanWriter::Subscriber { id, tx });
    }

    pub fn remove_subscriber(&self, id: u64) {
        self.writers.lock().retain(|writer| match writer {
            FanWriter::Terminal(_) => true,
            FanWriter::Subscriber { id: sub, .. } => *sub != id,
        });
    }

    /// Writes a fully formatted line to every current writer.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writers = self.writers.lock();
        let mut accepted = false;
        let mut last_err = None;
        writers.retain_mut(|writer| match writer {
            FanWriter::Terminal(terminal) => {
                let mut w = terminal.lock();
                match w.write_all(line.as_bytes()).and_then(|_| w.flush()) {
                    Ok(()) => accepted = true,
                    Err(err) => last_err = Some(err),
                }
                true
            }
            FanWriter::Subscriber { tx, .. } => {
                if tx.send(line.to_string()).is_ok() {
                    accepted = true;
                    true
                } else {
                    false
                }
            }
        });
        if accepted {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "no writer accepted the line")
            }))
        }
    }

    #[cfg(test)]
    pub(crate) fn writer_count(&self) -> usize {
        self.writers.lock().len()
    }
}

/// The output pipeline of a single process: decoration, prefixing, fan-out.
/// Fed complete lines (terminator included) by the child's reader pumps.
pub struct Sink {
    name: String,
    prefix: String,
    decorator: Mutex<Decorator>,
    fan_out: FanOut,
    log: LogSink,
}

impl Sink {
    /// Formats and broadcasts one raw child line.
    pub fn write_line(&self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let decorated = self.decorator.lock().decorate(line.trim_end());
        if let Some(note) = &decorated.note {
            self.log
                .write_line(&format!("failed to decode log line from process {:?}: {}", self.name, note));
        }

        let mut buf = String::new();
        for part in decorated.text.split('\n') {
            buf.push_str(&self.prefix);
            buf.push_str(part);
            buf.push('\n');
        }
        if let Err(err) = self.fan_out.write_line(&buf) {
            tracing::debug!(process = %self.name, error = %err, "no output writer accepted line");
        }
    }

    /// Registers a tail subscriber; it receives every line broadcast after
    /// this call.
    pub fn subscribe(&self, id: u64, tx: mpsc::UnboundedSender<String>) {
        self.fan_out.add_subscriber(id, tx);
    }

    pub fn unsubscribe(&self, id: u64) {
        self.fan_out.remove_subscriber(id);
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.fan_out.writer_count() - 1
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::SharedBuf;
    use super::*;
    use crate::env::Environment;
    use crate::process::FORMAT_JSON;

    fn spec(name: &str) -> ProcessSpec {
        ProcessSpec::new(name, "echo test", Environment::new())
    }

    #[test]
    fn colored_prefix_layout() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("test")], false, buf.terminal());
        let sink = hub.sink_for(&spec("test"));
        sink.write_line(b"This is a log message\n");

        // first palette color is cyan; name padded to the 8-column minimum
        let prefix = format!("{}{}{}test     │ {}", RESET, BOLD, Color::Cyan.code(), RESET);
        assert_eq!(buf.contents(), format!("{}This is a log message\n", prefix));
    }

    #[test]
    fn plain_prefix_layout_without_color() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("test")], true, buf.terminal());
        hub.sink_for(&spec("test")).write_line(b"This is a log message\n");
        assert_eq!(buf.contents(), "test     │ This is a log message\n");
    }

    #[test]
    fn prefix_width_follows_longest_name() {
        let buf = SharedBuf::new();
        let specs = [spec("api"), spec("long-worker-name")];
        let hub = OutputHub::new(&specs, true, buf.terminal());
        hub.sink_for(&specs[0]).write_line(b"x\n");
        assert_eq!(buf.contents(), "api              │ x\n");
    }

    #[test]
    fn sink_for_is_idempotent_per_name() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("one")], false, buf.terminal());
        let a = hub.sink_for(&spec("one"));
        let b = hub.sink_for(&spec("one"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn log_sink_uses_reserved_prefix() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("x")], true, buf.terminal());
        hub.log_sink().write_line("received interrupt signal");
        assert_eq!(buf.contents(), "muxrun   │ received interrupt signal\n");
    }

    #[test]
    fn fan_out_duplicates_lines_to_subscribers() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("p")], true, buf.terminal());
        let sink = hub.sink_for(&spec("p"));

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        sink.subscribe(1, tx1);
        sink.subscribe(2, tx2);

        sink.write_line(b"Log message 1\n");
        assert_eq!(rx1.try_recv().unwrap(), "p        │ Log message 1\n");
        assert_eq!(rx2.try_recv().unwrap(), "p        │ Log message 1\n");

        sink.unsubscribe(2);
        sink.write_line(b"Log message 2\n");
        assert_eq!(rx1.try_recv().unwrap(), "p        │ Log message 2\n");
        assert!(rx2.try_recv().is_err());

        // terminal saw everything
        assert!(buf.contents().contains("Log message 1"));
        assert!(buf.contents().contains("Log message 2"));
    }

    #[test]
    fn closed_subscribers_are_pruned_on_write() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("p")], true, buf.terminal());
        let sink = hub.sink_for(&spec("p"));

        let (tx, rx) = mpsc::unbounded_channel();
        sink.subscribe(7, tx);
        assert_eq!(sink.fan_out.writer_count(), 2);

        drop(rx);
        sink.write_line(b"after close\n");
        assert_eq!(sink.fan_out.writer_count(), 1);
    }

    #[test]
    fn broadcast_succeeds_if_one_writer_accepts() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "nope"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let terminal: Terminal = Arc::new(Mutex::new(Box::new(FailingWriter)));
        let fan_out = FanOut::new(terminal);
        assert!(fan_out.write_line("line\n").is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        fan_out.add_subscriber(1, tx);
        assert!(fan_out.write_line("line\n").is_ok());
        assert_eq!(rx.try_recv().unwrap(), "line\n");
    }

    #[test]
    fn undecodable_json_lines_are_forwarded_and_reported() {
        let buf = SharedBuf::new();
        let mut p = spec("svc");
        p.output.format = FORMAT_JSON.to_string();
        p.output.message_field = "message".to_string();
        p.output.level_field = "level".to_string();

        let hub = OutputHub::new(&[p.clone()], true, buf.terminal());
        hub.sink_for(&p).write_line(b"plain text sneaks through\n");

        let output = buf.contents();
        assert!(output.contains("svc      │ plain text sneaks through\n"), "{}", output);
        assert!(output.contains("muxrun   │ failed to decode log line"), "{}", output);
    }

    #[test]
    fn embedded_newlines_each_get_a_prefix() {
        let buf = SharedBuf::new();
        let hub = OutputHub::new(&[spec("p")], true, buf.terminal());
        let sink = hub.sink_for(&spec("p"));
        // a JSON message whose decoded text spans two physical lines
        sink.write_line(b"{\"message\":\"first\\nsecond\",\"level\":\"info\"}\n");

        let output = buf.contents();
        assert_eq!(output, "p        │ [INFO]\tfirst\np        │ second\n");
    }
}
