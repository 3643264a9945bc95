//! Line-oriented log streams.
//!
//! A [`LogStream`] is a bounded multi-producer, multi-consumer queue of
//! pre-formatted lines. Producers block when the stream is full; lines
//! are never dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Default capacity of the shared stream and every named stream.
pub const DEFAULT_STREAM_CAPACITY: usize = 5000;

/// A bounded, cloneable stream of log lines.
#[derive(Clone)]
pub struct LogStream {
    tx: mpsc::Sender<String>,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl LogStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueue a line, waiting for capacity.
    pub async fn send(&self, line: impl Into<String>) {
        // The stream owns a receiver, so the channel never closes.
        let _ = self.tx.send(line.into()).await;
    }

    /// Wait for the next line.
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Take the next line if one is queued.
    pub fn try_recv(&self) -> Option<String> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Take every queued line.
    pub fn drain(&self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Number of lines currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The shared stream plus lazily created named streams.
pub(crate) struct Streams {
    capacity: usize,
    shared: LogStream,
    named: Mutex<HashMap<String, LogStream>>,
}

impl Streams {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shared: LogStream::new(capacity),
            named: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn shared(&self) -> &LogStream {
        &self.shared
    }

    /// The stream registered under `id`, created on first use.
    pub(crate) async fn named(&self, id: &str) -> LogStream {
        let mut named = self.named.lock().await;
        named
            .entry(id.to_string())
            .or_insert_with(|| LogStream::new(self.capacity))
            .clone()
    }
}

/// Write `line` to every target stream in order.
pub(crate) async fn emit(targets: &[LogStream], line: impl Into<String>) {
    let line = line.into();
    for stream in targets {
        stream.send(line.clone()).await;
    }
}

/// How process output lines are decorated before hitting the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineStyle {
    /// Name prefix wrapped in an HTML color tag.
    #[default]
    Html,
    /// Padded name prefix only.
    Plain,
}

const PALETTE: [&str; 5] = ["#ff0000", "#008000", "#ff9933", "#0000ff", "#ff00ff"];

/// Prefixes process output with a fixed-width, color-tagged node name.
#[derive(Debug, Clone)]
pub struct LineTagger {
    name: String,
    width: usize,
    color: &'static str,
    style: LineStyle,
}

impl LineTagger {
    /// `index` is the member's position, used to pick a palette color.
    pub fn new(name: &str, width: usize, index: usize, style: LineStyle) -> Self {
        Self {
            name: name.to_string(),
            width,
            color: PALETTE[index % PALETTE.len()],
            style,
        }
    }

    pub fn tag(&self, line: &str) -> String {
        let prefix = format!("{:>width$} | ", self.name, width = self.width);
        match self.style {
            LineStyle::Html => format!(
                "<b><font color=\"{}\">{prefix}</font>{line}</b>",
                self.color
            ),
            LineStyle::Plain => format!("{prefix}{line}"),
        }
    }
}
