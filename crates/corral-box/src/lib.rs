pub mod blueprint;
pub mod classify;
pub mod client;
pub mod containerd;
pub mod engine;
pub mod set;
pub mod traits;

pub use blueprint::{BlueprintSettings, ContainerBlueprint};
pub use client::SandboxClient;
pub use containerd::ContainerdAdapter;
pub use engine::EngineAdapter;
pub use set::AdapterSet;
pub use traits::RuntimeAdapter;
