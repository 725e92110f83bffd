//! Core services of the control plane
//! 控制平面的核心服务

pub mod artifact;
pub mod credentials;
pub mod environment;
pub mod error;
pub mod idle_timeout;
pub mod program;
pub mod retention;
pub mod run;
pub mod run_executor;
pub mod warmup;

#[cfg(test)]
pub mod test_utils;

pub use artifact::ArtifactCollectorService;
pub use credentials::CredentialService;
pub use environment::EnvironmentService;
pub use error::{ControlError, ControlResult};
pub use idle_timeout::{IdleTimeoutController, IdleTimeoutService};
pub use program::ProgramService;
pub use retention::{RetentionPolicyController, RetentionPolicyService};
pub use run::RunService;
pub use run_executor::RunExecutor;
pub use warmup::{WarmupController, WarmupService};
