/// Concurrency guards for recurring sync cycles
pub mod flight;
pub mod lock;

pub use flight::SingleFlight;
pub use lock::AsyncLock;
