pub mod flow;
pub mod pool;
pub mod worker;

pub use flow::{ConnTracker, FlowKey, FlowTable};
pub use pool::{Pool, PoolControl};
