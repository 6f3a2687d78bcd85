//! # corral-core
//!
//! Run an untrusted program as a single child process under isolation and
//! resource limits, and report how it ended.
//!
//! One synchronous call, [`execute`], drives the whole lifecycle:
//! - validation of the request (`normalize`)
//! - namespaces, stdio, rlimits, privilege drop and seccomp in the child
//!   (`isolation`), with a close-on-exec handshake pipe (`pipe`)
//! - wall-clock, CPU-time and working-set enforcement (`monitor`) over
//!   every process the program starts (`scope`)
//! - the final sweep, reap and outcome classification (`collector`)
//!
//! ```no_run
//! use corral_core::{GuardSpec, IoSpec, KillReason, LimitSpec, ProgramSpec};
//!
//! let outcome = corral_core::execute(
//!     &ProgramSpec::new("/bin/sleep").arg("5"),
//!     &IoSpec::inherit(),
//!     &LimitSpec::default().real_time_ms(200),
//!     &GuardSpec::default(),
//! );
//! assert_eq!(outcome.kill_reason, KillReason::RealTime);
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod isolation;
pub mod monitor;
pub mod normalize;
pub mod pipe;
pub mod procfs;
pub mod result;
pub mod scope;

pub use config::{
    EngineConfig, EngineConfigBuilder, ExecutionRequest, GuardSpec, IoSpec, LimitSpec, ProgramSpec,
};
pub use engine::{Engine, execute};
pub use error::{CorralError, LaunchError, SetupStage};
pub use isolation::seccomp::POLICY_VERSION;
pub use result::{ExecutionOutcome, KillReason, ResourceUsage, UnenforcedLimits};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, CorralError>;
