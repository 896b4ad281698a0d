pub mod pool;
pub mod queue;

pub use pool::{cpu_degree, fan_out, FanOut};
pub use queue::{TaskHandle, TaskQueue};

// Re-export crossbeam_channel for plugin authors producing triggers
pub use crossbeam_channel;
