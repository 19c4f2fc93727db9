// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The seam towards the underlying fieldbus master.
//!
//! Frame encoding, sync manager and FMMU setup, and the wire itself belong
//! to the master library behind a [`Link`].  The bus only observes whether
//! each call succeeded.

use crate::adapter::{self, Adapter};
use crate::types::{AlState, ImageSize, PdoIdx, SlaveId, SlavePos, SlaveRev, SlaveState};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Adapter '{0}' could not be opened")]
    Adapter(String),
    #[error("No slaves found")]
    NoSlaves,
    #[error("No response from the bus")]
    NoResponse,
    #[error("Slave {0} is not present")]
    NoSuchSlave(SlavePos),
    #[error("SDO abort 0x{code:08X} on slave {slave} at 0x{index:04X}:{subindex:02X}")]
    SdoAbort {
        slave: SlavePos,
        index: u16,
        subindex: u8,
        code: u32,
    },
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Identity of a slave as found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveInfo {
    pub position: SlavePos,
    pub name: String,
    pub id: SlaveId,
    pub rev: SlaveRev,
    pub al_state: Option<AlState>,
}

/// Opens links on named adapters.
pub trait LinkProvider: Send + Sync + 'static {
    type Link: Link;

    fn open(&self, adapter: &str) -> LinkResult<Self::Link>;

    /// Adapters this provider can open, usable or not.
    fn adapters(&self) -> LinkResult<Vec<Adapter>> {
        Ok(adapter::enumerate())
    }
}

/// An open connection to one EtherCAT segment.
///
/// All calls are synchronous and may fail.  Slave positions refer to the
/// result of the latest [`Link::scan`].
pub trait Link: Send + 'static {
    /// Enumerates all responding slaves and brings them to PRE-OP.
    fn scan(&mut self) -> LinkResult<Vec<SlaveInfo>>;

    /// Writes the receive/transmit PDO assignment of one slave.  Either
    /// both assignments are taken over or the call fails.
    fn apply_pdo_assignment(&mut self, slave: SlavePos, rx: &[PdoIdx], tx: &[PdoIdx])
        -> LinkResult<()>;

    /// Lays out the process image and returns the per-slave image sizes,
    /// indexed by position.
    fn map_process_data(&mut self) -> LinkResult<Vec<ImageSize>>;

    /// Requests a state for all slaves.  Does not wait for it.
    fn request_state(&mut self, state: AlState) -> LinkResult<()>;

    /// Reads back the current state of all slaves.
    fn read_states(&mut self) -> LinkResult<Vec<SlaveState>>;

    /// Requests a state for one slave, optionally acknowledging its error
    /// indication.
    fn request_slave_state(&mut self, slave: SlavePos, state: AlState, ack: bool)
        -> LinkResult<()>;

    /// Re-runs configuration for a slave that fell back below SAFE-OP.
    /// Returns whether the slave is configured again.
    fn reconfigure_slave(&mut self, slave: SlavePos) -> LinkResult<bool>;

    /// Tries to re-address a slave that stopped answering.
    fn recover_slave(&mut self, slave: SlavePos) -> LinkResult<bool>;

    /// Sends the outstanding process data frame and receives the answer.
    /// Returns the working counter.
    fn exchange(&mut self) -> LinkResult<u16>;

    /// The working counter of a cycle in which every slave took part.
    fn expected_wkc(&self) -> u16;

    fn inputs(&self, slave: SlavePos) -> &[u8];

    fn outputs_mut(&mut self, slave: SlavePos) -> &mut [u8];

    /// Reads an SDO into `buf`, returning the number of bytes received.
    fn sdo_read(&mut self, slave: SlavePos, index: u16, subindex: u8, buf: &mut [u8])
        -> LinkResult<usize>;

    /// Releases the adapter.  Further calls fail.
    fn close(&mut self);
}
