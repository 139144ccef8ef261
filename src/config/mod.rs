//! Configuration: gatekeeper settings structs, defaults and TOML persistence.

pub mod paths;
pub mod settings;

pub use paths::GatePaths;
pub use settings::{
    BreakerSection, GateConfig, GateSection, LockSection, QueueSection, RecoverySection,
};
