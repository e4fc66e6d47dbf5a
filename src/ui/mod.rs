//! Status display implementations.
//!
//! - [`TerminalStatus`]: an `indicatif` tree, one line per node, children
//!   indented beneath their parent
//! - [`LogStatus`]: every update becomes a `tracing` event, for
//!   non-interactive runs
//!
//! Select one with [`StatusMode`].

use crate::collaborators::StatusSink;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// How status is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusMode {
    /// Rich terminal tree
    #[default]
    Terminal,
    /// Structured log events only
    Log,
}

impl std::str::FromStr for StatusMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "terminal" | "tty" => Ok(Self::Terminal),
            "log" | "json" => Ok(Self::Log),
            _ => anyhow::bail!("Invalid status mode '{}'. Valid values: terminal, log", s),
        }
    }
}

impl StatusMode {
    /// Build the root status node for this mode.
    pub fn root(self, title: &str) -> Arc<dyn StatusSink> {
        match self {
            StatusMode::Terminal => TerminalStatus::new(title),
            StatusMode::Log => LogStatus::new(title),
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct NodeState {
    text: String,
    props: Vec<(String, String)>,
    children: Vec<Arc<TerminalStatus>>,
}

/// One line in a terminal status tree.
pub struct TerminalStatus {
    multi: MultiProgress,
    bar: ProgressBar,
    depth: usize,
    state: Mutex<NodeState>,
}

impl TerminalStatus {
    /// Create a root node drawing to stderr.
    pub fn new(title: &str) -> Arc<Self> {
        Self::with_target(title, ProgressDrawTarget::stderr())
    }

    /// Create a root node that draws nowhere.
    pub fn hidden(title: &str) -> Arc<Self> {
        Self::with_target(title, ProgressDrawTarget::hidden())
    }

    fn with_target(title: &str, target: ProgressDrawTarget) -> Arc<Self> {
        let multi = MultiProgress::with_draw_target(target);
        let bar = multi.add(Self::styled_bar(0));
        let node = Arc::new(Self {
            multi,
            bar,
            depth: 0,
            state: Mutex::new(NodeState {
                text: String::new(),
                props: Vec::new(),
                children: Vec::new(),
            }),
        });
        node.update(title);
        node
    }

    fn styled_bar(depth: usize) -> ProgressBar {
        let style = ProgressStyle::default_spinner()
            .template("{prefix}{msg}")
            .expect("progress bar template is a valid static string");
        let bar = ProgressBar::new_spinner();
        bar.set_style(style);
        bar.set_prefix("  ".repeat(depth));
        bar
    }

    /// Current text of this node, without properties.
    pub fn text(&self) -> String {
        lock(&self.state).text.clone()
    }

    pub fn child_count(&self) -> usize {
        lock(&self.state).children.len()
    }

    fn redraw(&self, state: &NodeState) {
        let mut line = state.text.clone();
        for (name, value) in &state.props {
            line.push_str(&format!(" {}", style(format!("({}: {})", name, value)).dim()));
        }
        self.bar.set_message(line);
    }

    /// The bar drawn last among this node and its descendants.
    fn last_bar(&self) -> ProgressBar {
        let last_child = lock(&self.state).children.last().cloned();
        match last_child {
            Some(child) => child.last_bar(),
            None => self.bar.clone(),
        }
    }

    fn remove_from_display(&self) {
        let children = std::mem::take(&mut lock(&self.state).children);
        for child in children {
            child.remove_from_display();
        }
        self.bar.finish_and_clear();
        self.multi.remove(&self.bar);
    }

    fn new_child(&self) -> Arc<TerminalStatus> {
        let after = self.last_bar();
        let bar = self.multi.insert_after(&after, Self::styled_bar(self.depth + 1));
        let child = Arc::new(TerminalStatus {
            multi: self.multi.clone(),
            bar,
            depth: self.depth + 1,
            state: Mutex::new(NodeState {
                text: String::new(),
                props: Vec::new(),
                children: Vec::new(),
            }),
        });
        lock(&self.state).children.push(child.clone());
        child
    }
}

impl StatusSink for TerminalStatus {
    fn update(&self, message: &str) {
        let mut state = lock(&self.state);
        state.text = message.to_string();
        self.redraw(&state);
    }

    fn prop(&self, name: &str, value: &str) {
        let mut state = lock(&self.state);
        match state.props.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => state.props.push((name.to_string(), value.to_string())),
        }
        self.redraw(&state);
    }

    fn trunc(&self) {
        let children = std::mem::take(&mut lock(&self.state).children);
        for child in children {
            child.remove_from_display();
        }
    }

    fn clear(&self) {
        self.trunc();
        let mut state = lock(&self.state);
        state.text.clear();
        state.props.clear();
        self.redraw(&state);
    }

    fn child(&self) -> Arc<dyn StatusSink> {
        self.new_child()
    }
}

/// A status node that writes each update as a log event.
///
/// Nodes are named by their path from the root (`remap`, `remap.1`,
/// `remap.1.2`, ...).
pub struct LogStatus {
    path: String,
    next_child: AtomicUsize,
}

impl LogStatus {
    pub fn new(root: &str) -> Arc<Self> {
        Arc::new(Self {
            path: root.to_string(),
            next_child: AtomicUsize::new(1),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl StatusSink for LogStatus {
    fn update(&self, message: &str) {
        tracing::info!(status = %self.path, "{}", message);
    }

    fn prop(&self, name: &str, value: &str) {
        tracing::info!(status = %self.path, property = name, value, "status property");
    }

    fn trunc(&self) {}

    fn clear(&self) {}

    fn child(&self) -> Arc<dyn StatusSink> {
        let n = self.next_child.fetch_add(1, Ordering::SeqCst);
        LogStatus::new(&format!("{}.{}", self.path, n))
    }
}
