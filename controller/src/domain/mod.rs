//! Domain logic for the async work plane
//!
//! - `pubsub` - publisher and subscription progressor
//! - `asynccall` - executor, lease reaper, backoff laws
//! - `deployments` - deployment reconciler hooks
//! - `routing` - verb routing and invocation
//! - `encryption` - payload codec seam
//! - `observability` - structured counters and gauges

pub mod asynccall;
pub mod deployments;
pub mod encryption;
pub mod observability;
pub mod pubsub;
pub mod routing;

pub use asynccall::{Executor, ExecutorConfig, LeaseReaper};
pub use deployments::{ReconcileError, Reconciler};
pub use encryption::{PassthroughCodec, PayloadCodec};
pub use pubsub::{Progressor, ProgressorConfig, PublishError, Publisher};
pub use routing::{HttpVerbInvoker, RouteTable, VerbInvoker};
