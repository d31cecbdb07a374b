#![warn(missing_docs)]

//! Multipath NVMe driver core: controller lifecycle, command retry,
//! active/standby failover, and congestion resubmission.
//!
//! This crate models dual-ported NVMe volumes as logical volumes fronted
//! by an aggregate controller. I/O flows through a command pipeline with
//! a bounded retry budget; loss of the active path triggers a rate-limited
//! failover to a live standby, and I/O that cannot reach any path is
//! parked for a background drain task to resubmit.

pub mod command;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod failover;
pub mod namespace;
pub mod registry;
pub mod request;
pub mod resubmit;
pub mod shadow;
pub mod status;
pub mod transport;
pub mod volume;

pub use command::{CommandPipeline, CompletedCommand};
pub use config::MpathConfig;
pub use controller::{Controller, ControllerKind, CtrlId, CtrlState};
pub use engine::{EngineStats, MultipathEngine};
pub use error::{MpathError, MpathResult};
pub use failover::FailoverEngine;
pub use namespace::{Namespace, NsRole, PathState};
pub use registry::Registry;
pub use request::{CommandId, CommandIdGen, IoCommand, IoDone, IoOp, IoRequest};
pub use resubmit::{CongestionDrainer, DrainerHandle};
pub use shadow::{ShadowId, ShadowPool, ShadowPoolStats, ShadowRecord};
pub use status::{CommandStatus, IoOutcome};
pub use transport::{MockPathTransport, PathBehavior, PathId, PathTransport};
pub use volume::LogicalVolume;
