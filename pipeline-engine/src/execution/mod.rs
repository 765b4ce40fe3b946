// Execution
// Ordering, run state, backends and the dispatcher that ties them together

pub mod backend;
pub mod dispatcher;
pub mod events;
pub mod plan;
pub mod state;

pub use backend::{AirflowBackend, ArgoBackend, BackendError, ExecutionBackend, LocalBackend};
pub use dispatcher::{Dispatcher, MonitorOptions};
pub use events::{
    event_stream, progress_channel, EventSender, EventStream, ExecutionEvent, LogLevel, ProgressReceiver,
    ProgressSender,
};
pub use plan::ExecutionPlan;
pub use state::{NativeStatus, NodeReport, NodeState, NodeStatus, RunError, RunId, RunSnapshot, RunState};
