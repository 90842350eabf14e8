//! lpmd core library
//!
//! Exposes the state engine, CPU-mask store, utilization sampler, WLT proxy
//! engine and event loop so they can be exercised independently of the
//! `lpmd` binary (unit tests, and eventually an external D-Bus/XML-config
//! front end).

pub mod channel;
pub mod config;
pub mod cpumask;
pub mod engine;
pub mod error;
pub mod hfi;
pub mod knobs;
pub mod platform;
pub mod runtime;
pub mod sampler;
pub mod sysfs;
pub mod uevent;
pub mod wlt;

pub mod eventloop;

pub use config::{Config, ConfigState, LpmdConfig};
pub use cpumask::{CpuMaskStore, MaskId};
pub use engine::StateEngine;
pub use error::LpmdError;
pub use runtime::{LpmdMode, RuntimeData};
