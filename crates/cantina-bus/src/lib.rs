//! The CantinaOS event bus: hierarchical-topic publish/subscribe dispatch
//! with per-handler isolation, timeouts, and stable subscription handles.

mod bus;
mod metrics;

pub use bus::{
    EmitError, EventBus, Handler, HandlerFuture, HandlerId, Subscription, DEFAULT_HANDLER_TIMEOUT,
};
pub use metrics::{BusMetrics, BusMetricsSnapshot};
