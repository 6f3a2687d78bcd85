//! Error types for corral-core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorralError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("stdio redirection error: {0}")]
    Stdio(String),

    #[error("resource limit error: {0}")]
    ResourceLimit(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

/// Point of the launch sequence at which a launch failed.
///
/// Values above `Spawn` are reported by the child over the synchronization
/// pipe, so their numeric codes are part of that pipe's wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SetupStage {
    /// Parent-side validation of the request
    Validate = 0,
    /// Parent-side preparation (files, pipe, filter compilation)
    Prepare = 1,
    /// Creating the child process
    Spawn = 2,
    /// Waiting for the child to load its program image
    Handshake = 3,
    /// Reaping the exited child and reading its usage
    Collect = 4,
    ParentDeath = 10,
    ProcessGroup = 11,
    Network = 12,
    Mounts = 13,
    WorkingDir = 14,
    Stdio = 15,
    Descriptors = 16,
    ResourceLimits = 17,
    Identity = 18,
    Seccomp = 19,
    Exec = 20,
    /// Joining the per-run cgroup
    Cgroup = 21,
}

impl SetupStage {
    /// Decode a stage code received from the child
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Validate,
            1 => Self::Prepare,
            2 => Self::Spawn,
            3 => Self::Handshake,
            4 => Self::Collect,
            10 => Self::ParentDeath,
            11 => Self::ProcessGroup,
            12 => Self::Network,
            13 => Self::Mounts,
            14 => Self::WorkingDir,
            15 => Self::Stdio,
            16 => Self::Descriptors,
            17 => Self::ResourceLimits,
            18 => Self::Identity,
            19 => Self::Seccomp,
            20 => Self::Exec,
            21 => Self::Cgroup,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Prepare => "prepare",
            Self::Spawn => "spawn",
            Self::Handshake => "handshake",
            Self::Collect => "collect",
            Self::ParentDeath => "parent-death signal",
            Self::ProcessGroup => "process group",
            Self::Network => "network namespace",
            Self::Mounts => "mount isolation",
            Self::WorkingDir => "working directory",
            Self::Stdio => "stdio redirection",
            Self::Descriptors => "descriptor hygiene",
            Self::ResourceLimits => "resource limits",
            Self::Identity => "identity drop",
            Self::Seccomp => "seccomp",
            Self::Exec => "exec",
            Self::Cgroup => "cgroup",
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a launch never reached the program image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchError {
    pub stage: SetupStage,
    pub message: String,
}

impl LaunchError {
    pub fn new(stage: SetupStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    /// Wrap an engine error raised at `stage`
    #[must_use]
    pub fn from_error(stage: SetupStage, err: &CorralError) -> Self {
        Self::new(stage, err.to_string())
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "launch failed at {}: {}", self.stage, self.message)
    }
}

impl std::error::Error for LaunchError {}
