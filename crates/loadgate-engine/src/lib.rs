//! Load generation engine: transport, virtual users, stage scheduling and
//! the run controller that turns collected metrics into a verdict.

pub mod aggregator;
pub mod checks;
pub mod controller;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod health;
pub mod reporter;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod transport;
pub mod url;

pub use aggregator::MetricsAggregator;
pub use checks::{CheckFn, CheckSet};
pub use controller::{RunController, RunPhase, RunResult, RunTermination};
pub use error::{EngineError, EngineResult};
pub use evaluator::{evaluate, first_abort, is_empty_run};
pub use executor::{RequestBody, RequestExecutor, RequestTemplate};
pub use health::HealthGate;
pub use reporter::{ReportFormat, RunReport};
pub use runner::{RunnerState, VirtualUser};
pub use scenario::Scenario;
pub use scheduler::{SchedulerExit, StageScheduler};
pub use transport::{
    HttpTransport, MockReply, MockTransport, PreparedRequest, Transport, TransportError,
    TransportResponse,
};
