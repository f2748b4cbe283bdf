pub mod controller;
pub mod lifecycle;
pub mod ports;
pub mod registry;
pub mod retry;

pub use controller::LifecycleController;
pub use lifecycle::{Operation, Plan};
pub use ports::PortAllocator;
pub use registry::SandboxRegistry;
pub use retry::{ReadinessPolicy, RetryPolicy};
