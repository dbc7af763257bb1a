//! Process runtime: instance lock, signal handling and the control loop

mod control;
mod lock;
mod scheduler;

pub use control::Control;
pub use lock::InstanceLock;
pub use scheduler::{default_loader, Loader, Phase, Scheduler};
