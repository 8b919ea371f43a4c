//! Build progress reporting.
//!
//! The executor talks to a [`Printer`]; the `basic`, `steps`, and
//! `progress` styles live here. Each implementation serializes itself
//! internally, so notifications from concurrent workers never
//! interleave within one call.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::graph::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Built,
    UpToDate,
    Failed,
}

pub trait Printer: Send + Sync {
    /// A node's recipe is about to run.
    fn start(&self, node: &Node);
    /// Raw subprocess output from one of the node's commands.
    fn output(&self, node: &Node, stream: Stream, bytes: &[u8]);
    /// The node finished (or was found up to date).
    fn finish(&self, node: &Node, status: Status);
    /// Free-form engine message.
    fn info(&self, msg: &str);
}

fn label(node: &Node) -> &str {
    node.targets.first().map(String::as_str).unwrap_or("?")
}

fn write_raw(stream: Stream, bytes: &[u8]) {
    match stream {
        Stream::Stdout => {
            let _ = io::stdout().write_all(bytes);
        }
        Stream::Stderr => {
            let _ = io::stderr().write_all(bytes);
        }
    }
}

/// Echoes each recipe as it runs, like a classic make.
#[derive(Default)]
pub struct BasicPrinter {
    lock: Mutex<()>,
}

impl BasicPrinter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Printer for BasicPrinter {
    fn start(&self, node: &Node) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if !node.attrs.quiet {
            for line in &node.recipe {
                println!("{}", line);
            }
        }
    }

    fn output(&self, _node: &Node, stream: Stream, bytes: &[u8]) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        write_raw(stream, bytes);
    }

    fn finish(&self, node: &Node, status: Status) {
        if status == Status::Failed {
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            eprintln!("knit: recipe for '{}' failed", label(node));
        }
    }

    fn info(&self, msg: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        println!("knit: {}", msg);
    }
}

/// Numbers each step: `[3/7] target`.
pub struct StepsPrinter {
    state: Mutex<usize>,
    total: usize,
}

impl StepsPrinter {
    /// `total` is the number of nodes that could run a recipe, computed
    /// from the graph up front.
    pub fn new(total: usize) -> Self {
        Self {
            state: Mutex::new(0),
            total,
        }
    }
}

impl Printer for StepsPrinter {
    fn start(&self, node: &Node) {
        let mut count = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        println!("[{}/{}] {}", *count, self.total, label(node));
        if !node.attrs.quiet {
            for line in &node.recipe {
                println!("{}", line);
            }
        }
    }

    fn output(&self, _node: &Node, stream: Stream, bytes: &[u8]) {
        let _guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        write_raw(stream, bytes);
    }

    fn finish(&self, node: &Node, status: Status) {
        if status == Status::Failed {
            let _guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            eprintln!("knit: recipe for '{}' failed", label(node));
        }
    }

    fn info(&self, msg: &str) {
        let _guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        println!("knit: {}", msg);
    }
}

/// Rewrites a single status line on stderr as nodes complete; recipe
/// output still goes through untouched on its own lines.
pub struct ProgressPrinter {
    state: Mutex<usize>,
    total: usize,
}

impl ProgressPrinter {
    pub fn new(total: usize) -> Self {
        Self {
            state: Mutex::new(0),
            total,
        }
    }

    fn redraw(&self, done: usize, current: &str) {
        let mut err = io::stderr();
        let _ = write!(err, "\r\x1b[K[{}/{}] {}", done, self.total, current);
        let _ = err.flush();
    }
}

impl Printer for ProgressPrinter {
    fn start(&self, node: &Node) {
        let done = *self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.redraw(done, label(node));
    }

    fn output(&self, _node: &Node, stream: Stream, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let _guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let _ = io::stderr().write_all(b"\r\x1b[K");
        write_raw(stream, bytes);
    }

    fn finish(&self, node: &Node, status: Status) {
        let mut done = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match status {
            Status::Built => {
                *done += 1;
                self.redraw(*done, label(node));
            }
            Status::Failed => {
                let _ = io::stderr().write_all(b"\r\x1b[K");
                eprintln!("knit: recipe for '{}' failed", label(node));
            }
            Status::UpToDate => {}
        }
    }

    fn info(&self, msg: &str) {
        let _guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let _ = io::stderr().write_all(b"\r\x1b[K");
        eprintln!("knit: {}", msg);
    }
}

/// One printer event, as observed by [`RecordingPrinter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    Output(String, Stream, Vec<u8>),
    Finish(String, Status),
    Info(String),
}

/// Records the notification stream instead of printing it. The
/// scheduling tests assert ordering properties against the recorded
/// events.
#[derive(Default)]
pub struct RecordingPrinter {
    events: Mutex<Vec<Event>>,
}

impl RecordingPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl Printer for RecordingPrinter {
    fn start(&self, node: &Node) {
        self.push(Event::Start(label(node).to_string()));
    }

    fn output(&self, node: &Node, stream: Stream, bytes: &[u8]) {
        self.push(Event::Output(
            label(node).to_string(),
            stream,
            bytes.to_vec(),
        ));
    }

    fn finish(&self, node: &Node, status: Status) {
        self.push(Event::Finish(label(node).to_string(), status));
    }

    fn info(&self, msg: &str) {
        self.push(Event::Info(msg.to_string()));
    }
}

/// Drops command echo and informational chatter; recipe output and
/// failures still come through.
pub struct QuietPrinter(pub Box<dyn Printer>);

impl Printer for QuietPrinter {
    fn start(&self, _node: &Node) {}

    fn output(&self, node: &Node, stream: Stream, bytes: &[u8]) {
        self.0.output(node, stream, bytes);
    }

    fn finish(&self, node: &Node, status: Status) {
        if status == Status::Failed {
            self.0.finish(node, status);
        }
    }

    fn info(&self, _msg: &str) {}
}

/// Build the printer for a requested style name.
pub fn for_style(style: &str, total: usize) -> Option<Box<dyn Printer>> {
    match style {
        "basic" => Some(Box::new(BasicPrinter::new())),
        "steps" => Some(Box::new(StepsPrinter::new(total))),
        "progress" => Some(Box::new(ProgressPrinter::new(total))),
        _ => None,
    }
}
