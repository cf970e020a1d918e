//! # Vigil Engine
//!
//! Always-on orchestration engine: watches external state through pull-style
//! providers, decides when to act, queues and executes work with bounded
//! concurrency, routes notifications, and gates risky actions behind human
//! approval. All state that matters survives a process restart.
//!
//! ## Architecture
//! ```text
//! Scheduler (one tokio loop per concern)
//!   ├── decision loop (30s): StateProvider.pull() → DecisionEngine.evaluate()
//!   │     └── Decisions → NotificationRouter / TaskQueue / ApprovalGate
//!   ├── flush loop (60s): TrackerState → disk (atomic rename)
//!   ├── reaper loop (60s): requeue claims with stale heartbeats
//!   └── health loop (300s): Watchdog → restart dead services (rate-limited)
//!
//! TaskExecutor (N workers)
//!   └── claim_next → TaskRunner.run(payload, timeout) → complete / fail
//!         └── fail: exponential backoff until max_retries, then dead_letter
//! ```

pub mod approval;
pub mod decision;
pub mod executor;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod snapshot;
pub mod tracker;
pub mod watchdog;

pub use approval::{ApprovalGate, ApprovalRequest, ApprovalStatus};
pub use decision::{ActionType, Decision, DecisionEngine, Priority, Trigger};
pub use executor::{CommandRunner, RunOutput, RunnerError, TaskExecutor, TaskRunner};
pub use queue::{RetryPolicy, Task, TaskQueue, TaskStatus};
pub use router::{Channel, ConsoleChannel, NotificationRouter, QuietHours};
pub use scheduler::{ProcessState, Scheduler};
pub use snapshot::{FileStateProvider, StateProvider, StateSnapshot};
pub use tracker::{Period, TrackerState};
pub use watchdog::{PidFileProbe, ProcessProbe, ServiceSpec, Watchdog};
