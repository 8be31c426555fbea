//! Core of netlab: kind registry, node lifecycle, dependency-ordered
//! orchestration and link wiring for container-based network labs.

pub mod command;
pub mod config;
pub mod dependency;
pub mod error;
pub mod exec;
pub mod kind_registry;
pub mod lab;
pub mod link;
pub mod node;
pub mod orchestrator;
pub mod readiness;
pub mod report;
pub mod runtime;
pub mod stages;
pub mod state_machine;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::NetlabConfig;
pub use error::{NetlabError, NetlabResult};
pub use kind_registry::{Credentials, KindEntry, KindRegistry, PlatformHints};
pub use lab::LabDefinition;
pub use orchestrator::{Deployment, LabPlan, Orchestrator};
pub use report::LabReport;
pub use state_machine::DeploymentState;
