// Execution Events
// Status stream for submitted runs and their nodes

use crate::execution::state::{NodeState, RunError, RunId, RunState};
use crate::parser::models::RuntimeTarget;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Progress events as a `Stream`
pub type EventStream = UnboundedReceiverStream<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Consume a progress receiver as a stream that ends once every sender is gone
pub fn event_stream(receiver: ProgressReceiver) -> EventStream {
    UnboundedReceiverStream::new(receiver)
}

/// Events emitted while runs progress
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Artifact handed to a backend
    RunSubmitted {
        run_id: RunId,
        pipeline_name: String,
        runtime: RuntimeTarget,
        total_nodes: usize,
    },

    /// Run moved to a new state
    RunStateChanged {
        run_id: RunId,
        state: RunState,
        error: Option<RunError>,
    },

    /// Node moved to a new state
    NodeStateChanged {
        run_id: RunId,
        node_id: String,
        state: NodeState,
        attempts: u32,
        message: Option<String>,
    },

    /// Log message (info, warning, error)
    Log {
        run_id: RunId,
        level: LogLevel,
        message: String,
        node_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_submitted(
        run_id: &RunId,
        pipeline_name: impl Into<String>,
        runtime: RuntimeTarget,
        total_nodes: usize,
    ) -> Self {
        Self::RunSubmitted {
            run_id: run_id.clone(),
            pipeline_name: pipeline_name.into(),
            runtime,
            total_nodes,
        }
    }

    pub fn run_state_changed(run_id: &RunId, state: RunState, error: Option<RunError>) -> Self {
        Self::RunStateChanged {
            run_id: run_id.clone(),
            state,
            error,
        }
    }

    pub fn node_state_changed(
        run_id: &RunId,
        node_id: impl Into<String>,
        state: NodeState,
        attempts: u32,
        message: Option<String>,
    ) -> Self {
        Self::NodeStateChanged {
            run_id: run_id.clone(),
            node_id: node_id.into(),
            state,
            attempts,
            message,
        }
    }

    /// Create an info log event
    pub fn info(run_id: &RunId, message: impl Into<String>, node_id: Option<String>) -> Self {
        Self::Log {
            run_id: run_id.clone(),
            level: LogLevel::Info,
            message: message.into(),
            node_id,
        }
    }

    /// Create a warning log event
    pub fn warning(run_id: &RunId, message: impl Into<String>, node_id: Option<String>) -> Self {
        Self::Log {
            run_id: run_id.clone(),
            level: LogLevel::Warning,
            message: message.into(),
            node_id,
        }
    }

    /// Run the event belongs to
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunSubmitted { run_id, .. }
            | Self::RunStateChanged { run_id, .. }
            | Self::NodeStateChanged { run_id, .. }
            | Self::Log { run_id, .. } => run_id,
        }
    }

    /// True for the event that ends a run's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunStateChanged { state, .. } if state.is_terminal())
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);

    fn send_all(&self, events: Vec<ExecutionEvent>) {
        for event in events {
            self.send_event(event);
        }
    }
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
