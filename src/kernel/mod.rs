//! Driving the external proxy kernel: config generation, process lifecycle and
//! the control-plane API

pub mod config;
pub mod controller;
pub mod meta;
pub mod process;

pub use config::{KernelConfig, KernelNode, SELECT_GROUP};
pub use controller::Controller;
pub use meta::{MetaClient, MetaSession, DEFAULT_META_URL};
pub use process::{wait_for_port, wait_for_release, KernelBinary, KernelProcess};

use std::path::PathBuf;
use std::time::Duration;

/// Default control-plane port
pub const DEFAULT_CONTROLLER_PORT: u16 = 9090;

/// Default first egress port; dedicated kernels count up from here
pub const DEFAULT_BASE_PORT: u16 = 14000;

/// Default readiness deadline for a kernel carrying a whole batch
const DEFAULT_SHARED_READY_SECS: u64 = 12;

/// Default readiness deadline for a single-node kernel
const DEFAULT_DEDICATED_READY_SECS: u64 = 8;

/// How long to wait for a previous kernel to let go of a port
const DEFAULT_RELEASE_SECS: u64 = 3;

/// Where the kernel lives and how locally spawned instances are wired up
#[derive(Debug, Clone)]
pub struct KernelSettings {
    pub binary: PathBuf,
    pub controller_port: u16,
    pub base_port: u16,
    pub secret: Option<String>,
    /// Readiness deadline for the batch kernel
    pub shared_ready_timeout: Duration,
    /// Readiness deadline for each single-node kernel
    pub dedicated_ready_timeout: Duration,
    /// Wait for a port left over from an earlier kernel before reusing it
    pub release_timeout: Duration,
}

impl KernelSettings {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            controller_port: DEFAULT_CONTROLLER_PORT,
            base_port: DEFAULT_BASE_PORT,
            secret: None,
            shared_ready_timeout: Duration::from_secs(DEFAULT_SHARED_READY_SECS),
            dedicated_ready_timeout: Duration::from_secs(DEFAULT_DEDICATED_READY_SECS),
            release_timeout: Duration::from_secs(DEFAULT_RELEASE_SECS),
        }
    }

    pub fn with_controller_port(mut self, port: u16) -> Self {
        self.controller_port = port;
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_ready_timeouts(mut self, shared: Duration, dedicated: Duration) -> Self {
        self.shared_ready_timeout = shared;
        self.dedicated_ready_timeout = dedicated;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// A config for a kernel carrying `nodes` with the control plane enabled.
    pub fn controlled_config(&self, nodes: Vec<KernelNode>) -> KernelConfig {
        KernelConfig::new(self.base_port)
            .with_controller(self.controller_port, self.secret.clone())
            .with_nodes(nodes)
    }

    pub fn controller(&self) -> crate::Result<Controller> {
        Controller::new(self.controller_port, self.secret.clone())
    }
}
