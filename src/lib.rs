// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Lifecycle and cyclic process-data exchange for an EtherCAT segment.
//!
//! A [`Bus`] opens a network adapter, scans the slaves, applies a
//! [`PdoMapping`] and drives the segment through PRE-OP and SAFE-OP into
//! OP.  While operational, three background activities keep it running: a
//! frame pump exchanging one process data frame per millisecond, a PDO
//! update copying the image to and from the registered [`SlaveHandle`]s at
//! the configured cycle time, and a health monitor that nudges slaves back
//! into OP and reconnects after a cable loss.
//!
//! The wire itself is behind the [`Link`] trait.  The crate ships a
//! simulated segment in [`sim`] for tests and demos.
//!
//! ```no_run
//! use ethercat_bus::{sim::{SimBus, SimDevice}, BusBuilder, GenericSlave};
//! use std::sync::Arc;
//!
//! # fn main() -> ethercat_bus::Result<()> {
//! let sim = SimBus::new().with_device(SimDevice::io_module());
//! let bus = BusBuilder::new().adapter("sim0").build(sim)?;
//! let io = Arc::new(GenericSlave::new(0, 1, 1));
//! bus.register_slave(io.clone())?;
//! bus.open()?;
//! io.set_output(&[0xFF])?;
//! bus.close();
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod beckhoff;
pub mod sim;
pub mod util;

mod bus;
mod convert;
mod link;
mod mapping;
mod probe;
mod scheduler;
mod slave;
mod types;

pub use self::{
    adapter::Adapter,
    bus::{
        Bus, BusBuilder, BusConfig, BusFault, BusState, BusStatus, ReconnectPolicy,
        DEFAULT_CYCLE_TIME, DEFAULT_STATE_TIMEOUT,
    },
    link::{Link, LinkError, LinkProvider, LinkResult, SlaveInfo},
    mapping::{NetworkSettings, PdoAssignment, PdoMapping},
    probe::{CycleStats, LatencyProbe},
    scheduler::{CycleCounts, FRAME_PERIOD, HEALTH_PERIOD},
    slave::{GenericSlave, SlaveHandle},
    types::*,
};
