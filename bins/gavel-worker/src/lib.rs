//! Gavel evaluation core.
//!
//! Build a submission once, run it against every test case in an isolated
//! sandbox, compare the output and report one verdict per test case.
pub mod build;
pub mod comparator;
pub mod evaluator;
pub mod limits;
pub mod metrics;
pub mod registry;
pub mod sandbox;

pub use build::{BuildArtifact, BuildError, BuildManager};
pub use evaluator::Evaluator;
pub use registry::{LanguageConfigManager, LanguageRegistry};
pub use sandbox::{DockerSandbox, ProcessSandbox, ProcessSandboxOptions, Sandbox};
