// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! An in-process EtherCAT segment.
//!
//! [`SimBus`] stands in for the master library and the wire: it keeps a
//! list of devices with a small object dictionary, walks them through the
//! AL states, exchanges process data and lets callers inject faults such
//! as a pulled cable or a watchdog error.

use crate::adapter::Adapter;
use crate::beckhoff;
use crate::link::{Link, LinkError, LinkProvider, LinkResult, SlaveInfo};
use crate::types::{
    AlState, AlStatusCode, ImageSize, PdoEntry, PdoIdx, SlaveId, SlavePos, SlaveRev, SlaveState,
};
use log::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

const ABORT_NO_OBJECT: u32 = 0x0602_0000;
const ABORT_NO_SUBINDEX: u32 = 0x0609_0011;
const ABORT_VALUE_RANGE: u32 = 0x0609_0030;
const ABORT_WRONG_STATE: u32 = 0x0800_0022;

/// How a simulated device produces its input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Inputs only change through [`SimBus::set_inputs`].
    Static,
    /// Inputs mirror the outputs received in the previous cycle.
    Loopback,
    /// Every byte of the input image carries the same cycle counter.
    Counter,
}

/// Description of a simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    name: String,
    id: SlaveId,
    rev: SlaveRev,
    device_type: u32,
    hw_version: String,
    sw_version: String,
    rx_pdos: BTreeMap<u16, Vec<PdoEntry>>,
    tx_pdos: BTreeMap<u16, Vec<PdoEntry>>,
    factory_rx: Vec<u16>,
    factory_tx: Vec<u16>,
    input_mode: InputMode,
}

fn entries(list: &[(u16, u8, u8)]) -> Vec<PdoEntry> {
    list.iter().map(|&(i, s, b)| PdoEntry::new(i, s, b)).collect()
}

impl SimDevice {
    pub fn new(name: impl Into<String>, id: SlaveId) -> Self {
        SimDevice {
            name: name.into(),
            id,
            rev: SlaveRev::new(0x0010_0000, 0),
            device_type: 0,
            hw_version: "00".into(),
            sw_version: "01".into(),
            rx_pdos: BTreeMap::new(),
            tx_pdos: BTreeMap::new(),
            factory_rx: Vec::new(),
            factory_tx: Vec::new(),
            input_mode: InputMode::Static,
        }
    }

    /// Adds a receive PDO that is part of the factory assignment.
    pub fn rx_pdo(mut self, idx: u16, list: &[(u16, u8, u8)]) -> Self {
        self.rx_pdos.insert(idx, entries(list));
        self.factory_rx.push(idx);
        self
    }

    /// Adds a transmit PDO that is part of the factory assignment.
    pub fn tx_pdo(mut self, idx: u16, list: &[(u16, u8, u8)]) -> Self {
        self.tx_pdos.insert(idx, entries(list));
        self.factory_tx.push(idx);
        self
    }

    /// Adds a receive PDO that can be selected but is not assigned.
    pub fn alt_rx_pdo(mut self, idx: u16, list: &[(u16, u8, u8)]) -> Self {
        self.rx_pdos.insert(idx, entries(list));
        self
    }

    /// Adds a transmit PDO that can be selected but is not assigned.
    pub fn alt_tx_pdo(mut self, idx: u16, list: &[(u16, u8, u8)]) -> Self {
        self.tx_pdos.insert(idx, entries(list));
        self
    }

    pub fn device_type(mut self, device_type: u32) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn versions(mut self, hw: impl Into<String>, sw: impl Into<String>) -> Self {
        self.hw_version = hw.into();
        self.sw_version = sw.into();
        self
    }

    pub fn input_mode(mut self, mode: InputMode) -> Self {
        self.input_mode = mode;
        self
    }

    /// A generic module with one byte of inputs and outputs; 16 bit
    /// variants are available as 0x1601 / 0x1A01.
    pub fn io_module() -> Self {
        SimDevice::new("IO module", SlaveId::new(0x0000_0539, 0x0000_0001))
            .device_type(0x0001_0191)
            .rx_pdo(0x1600, &[(0x7000, 1, 8)])
            .alt_rx_pdo(0x1601, &[(0x7010, 1, 16)])
            .tx_pdo(0x1A00, &[(0x6000, 1, 8)])
            .alt_tx_pdo(0x1A01, &[(0x6010, 1, 16)])
    }

    pub fn ek1100() -> Self {
        SimDevice::new("EK1100", beckhoff::EK1100_ID)
    }

    pub fn el1008() -> Self {
        (0..8).fold(
            SimDevice::new("EL1008", beckhoff::EL1008_ID).device_type(0x0001_1389),
            |dev, ch| dev.tx_pdo(0x1A00 + ch, &[(0x6000 + 0x10 * ch, 1, 1)]),
        )
    }

    pub fn el2008() -> Self {
        (0..8).fold(
            SimDevice::new("EL2008", beckhoff::EL2008_ID).device_type(0x0001_1389),
            |dev, ch| dev.rx_pdo(0x1600 + ch, &[(0x7000 + 0x10 * ch, 1, 1)]),
        )
    }

    pub fn el3104() -> Self {
        (0..4).fold(
            SimDevice::new("EL3104", beckhoff::EL3104_ID).device_type(0x0001_1389),
            |dev, ch| {
                let obj = 0x6000 + 0x10 * ch;
                dev.tx_pdo(0x1A00 + 2 * ch, &[(obj, 0x01, 16), (obj, 0x11, 16)])
            },
        )
    }

    pub fn el4132() -> Self {
        SimDevice::new("EL4132", beckhoff::EL4132_ID)
            .device_type(0x0001_1389)
            .rx_pdo(0x1600, &[(0x3001, 1, 16)])
            .rx_pdo(0x1601, &[(0x3002, 1, 16)])
    }

    fn image_bits(pdos: &BTreeMap<u16, Vec<PdoEntry>>, assigned: &[u16]) -> usize {
        assigned
            .iter()
            .filter_map(|idx| pdos.get(idx))
            .flat_map(|e| e.iter())
            .map(|e| usize::from(e.bit_len))
            .sum()
    }
}

struct Device {
    spec: SimDevice,
    state: Option<AlState>,
    error: bool,
    al_status: u16,
    rx_assign: Vec<u16>,
    tx_assign: Vec<u16>,
    inputs: Vec<u8>,
    received: Vec<u8>,
    counter: u8,
}

impl Device {
    fn new(spec: SimDevice) -> Self {
        Device {
            rx_assign: spec.factory_rx.clone(),
            tx_assign: spec.factory_tx.clone(),
            spec,
            state: Some(AlState::Init),
            error: false,
            al_status: 0,
            inputs: Vec::new(),
            received: Vec::new(),
            counter: 0,
        }
    }

    fn power_cycle(&mut self) {
        self.state = Some(AlState::Init);
        self.error = false;
        self.al_status = 0;
        self.rx_assign = self.spec.factory_rx.clone();
        self.tx_assign = self.spec.factory_tx.clone();
    }

    fn image(&self) -> ImageSize {
        ImageSize::new(
            (SimDevice::image_bits(&self.spec.tx_pdos, &self.tx_assign) + 7) / 8,
            (SimDevice::image_bits(&self.spec.rx_pdos, &self.rx_assign) + 7) / 8,
        )
    }

    fn refuse(&mut self, code: u16) {
        self.error = true;
        self.al_status = code;
    }

    fn goto(&mut self, target: AlState, mapped: bool) {
        let current = match self.state {
            Some(st) => st,
            None => return,
        };
        let allowed = match target {
            AlState::Init | AlState::PreOp => true,
            AlState::Boot => current == AlState::Init,
            AlState::SafeOp => mapped && current >= AlState::PreOp,
            AlState::Op => current == AlState::SafeOp || current == AlState::Op,
        };
        if allowed {
            self.state = Some(target);
            self.error = false;
            self.al_status = 0;
        } else {
            self.refuse(AlStatusCode::INVALID_STATE_CHANGE.0);
        }
    }
}

struct SimState {
    adapters: Vec<Adapter>,
    devices: Vec<Device>,
    link_up: bool,
    open_links: usize,
    fail_open: bool,
    reject_state: Option<(AlState, AlStatusCode)>,
    reject_mapping: BTreeSet<SlavePos>,
    sdo_delay: Duration,
    exchanges: u64,
    op_exchanges: u64,
}

/// Handle to a simulated segment.  Clones share the same segment.
#[derive(Clone)]
pub struct SimBus {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    /// An empty segment reachable through the adapter `sim0`.
    pub fn new() -> Self {
        SimBus {
            inner: Arc::new(Mutex::new(SimState {
                adapters: vec![Adapter::new("sim0".into(), "simulated segment".into(), true)],
                devices: Vec::new(),
                link_up: true,
                open_links: 0,
                fail_open: false,
                reject_state: None,
                reject_mapping: BTreeSet::new(),
                sdo_delay: Duration::from_micros(0),
                exchanges: 0,
                op_exchanges: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_device(self, device: SimDevice) -> Self {
        self.add_device(device);
        self
    }

    pub fn with_adapter(self, name: &str, usable: bool) -> Self {
        self.state()
            .adapters
            .push(Adapter::new(name.into(), "simulated segment".into(), usable));
        self
    }

    pub fn add_device(&self, device: SimDevice) {
        self.state().devices.push(Device::new(device));
    }

    /// Pulls the cable: nothing answers until [`SimBus::reconnect`].
    pub fn disconnect(&self) {
        let mut st = self.state();
        info!("SIM: link down");
        st.link_up = false;
        for dev in &mut st.devices {
            dev.state = None;
        }
    }

    /// Plugs the cable back in.  Devices come back power-cycled.
    pub fn reconnect(&self) {
        let mut st = self.state();
        info!("SIM: link up");
        st.link_up = true;
        for dev in &mut st.devices {
            dev.power_cycle();
        }
    }

    /// Drops a device to SAFE-OP with its error indication set.
    pub fn fault_slave(&self, slave: SlavePos, code: AlStatusCode) {
        if let Some(dev) = self.state().devices.get_mut(slave.index()) {
            if dev.state >= Some(AlState::SafeOp) {
                dev.state = Some(AlState::SafeOp);
            }
            dev.refuse(code.0);
        }
    }

    /// Makes every device refuse the given target state.
    pub fn reject_state(&self, reject: Option<(AlState, AlStatusCode)>) {
        self.state().reject_state = reject;
    }

    pub fn reject_mapping(&self, slave: SlavePos, reject: bool) {
        let mut st = self.state();
        if reject {
            st.reject_mapping.insert(slave);
        } else {
            st.reject_mapping.remove(&slave);
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn set_sdo_delay(&self, delay: Duration) {
        self.state().sdo_delay = delay;
    }

    /// Sets the input image a device reports from the next cycle on.
    pub fn set_inputs(&self, slave: SlavePos, data: &[u8]) {
        if let Some(dev) = self.state().devices.get_mut(slave.index()) {
            let n = dev.inputs.len().min(data.len());
            dev.inputs[..n].copy_from_slice(&data[..n]);
        }
    }

    /// The output image a device most recently received in OP.
    pub fn transmitted(&self, slave: SlavePos) -> Vec<u8> {
        self.state()
            .devices
            .get(slave.index())
            .map(|dev| dev.received.clone())
            .unwrap_or_default()
    }

    pub fn slave_state(&self, slave: SlavePos) -> Option<AlState> {
        self.state().devices.get(slave.index()).and_then(|dev| dev.state)
    }

    pub fn open_links(&self) -> usize {
        self.state().open_links
    }

    pub fn exchanges(&self) -> u64 {
        self.state().exchanges
    }

    /// Frames exchanged while every slave was in OP without an error.
    pub fn op_exchanges(&self) -> u64 {
        self.state().op_exchanges
    }
}

impl LinkProvider for SimBus {
    type Link = SimLink;

    fn open(&self, adapter: &str) -> LinkResult<SimLink> {
        let mut st = self.state();
        if st.fail_open || !st.adapters.iter().any(|a| a.name == adapter) {
            return Err(LinkError::Adapter(adapter.into()));
        }
        st.open_links += 1;
        debug!("SIM: link opened on {}", adapter);
        Ok(SimLink {
            sim: self.clone(),
            open: true,
            mapped: false,
            sizes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            applied: BTreeMap::new(),
        })
    }

    fn adapters(&self) -> LinkResult<Vec<Adapter>> {
        Ok(self.state().adapters.clone())
    }
}

/// A link opened on a [`SimBus`].
pub struct SimLink {
    sim: SimBus,
    open: bool,
    mapped: bool,
    sizes: Vec<ImageSize>,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
    applied: BTreeMap<SlavePos, (Vec<u16>, Vec<u16>)>,
}

impl SimLink {
    fn segment(&self) -> LinkResult<MutexGuard<'_, SimState>> {
        if !self.open {
            return Err(LinkError::Rejected("link is closed".into()));
        }
        let st = self.sim.state();
        if !st.link_up {
            return Err(LinkError::NoResponse);
        }
        Ok(st)
    }
}

fn device(st: &mut SimState, slave: SlavePos) -> LinkResult<&mut Device> {
    match st.devices.get_mut(slave.index()) {
        Some(dev) if dev.state.is_some() => Ok(dev),
        _ => Err(LinkError::NoSuchSlave(slave)),
    }
}

impl Link for SimLink {
    fn scan(&mut self) -> LinkResult<Vec<SlaveInfo>> {
        let mut st = self.segment().map_err(|_| LinkError::NoSlaves)?;
        if st.devices.is_empty() {
            return Err(LinkError::NoSlaves);
        }
        let infos = st
            .devices
            .iter_mut()
            .enumerate()
            .map(|(i, dev)| {
                dev.state = Some(AlState::PreOp);
                dev.error = false;
                dev.al_status = 0;
                SlaveInfo {
                    position: SlavePos::from(i as u16),
                    name: dev.spec.name.clone(),
                    id: dev.spec.id,
                    rev: SlaveRev::new(dev.spec.rev.revision_number, i as u32 + 1),
                    al_state: dev.state,
                }
            })
            .collect();
        drop(st);
        self.mapped = false;
        Ok(infos)
    }

    fn apply_pdo_assignment(&mut self, slave: SlavePos, rx: &[PdoIdx], tx: &[PdoIdx])
        -> LinkResult<()>
    {
        let mut st = self.segment()?;
        let rejected = st.reject_mapping.contains(&slave);
        let dev = device(&mut st, slave)?;
        let abort = |index, subindex, code| LinkError::SdoAbort { slave, index, subindex, code };
        if dev.state != Some(AlState::PreOp) {
            return Err(abort(0x1C12, 0, ABORT_WRONG_STATE));
        }
        if rejected {
            return Err(abort(0x1C12, 0, ABORT_VALUE_RANGE));
        }
        for (i, idx) in rx.iter().enumerate() {
            if !dev.spec.rx_pdos.contains_key(&idx.0) {
                return Err(abort(0x1C12, i as u8 + 1, ABORT_VALUE_RANGE));
            }
        }
        for (i, idx) in tx.iter().enumerate() {
            if !dev.spec.tx_pdos.contains_key(&idx.0) {
                return Err(abort(0x1C13, i as u8 + 1, ABORT_VALUE_RANGE));
            }
        }
        dev.rx_assign = rx.iter().map(|i| i.0).collect();
        dev.tx_assign = tx.iter().map(|i| i.0).collect();
        let assigned = (dev.rx_assign.clone(), dev.tx_assign.clone());
        drop(st);
        self.applied.insert(slave, assigned);
        Ok(())
    }

    fn map_process_data(&mut self) -> LinkResult<Vec<ImageSize>> {
        let mut st = self.segment()?;
        let sizes: Vec<ImageSize> = st
            .devices
            .iter_mut()
            .map(|dev| {
                let size = dev.image();
                dev.inputs.resize(size.inputs, 0);
                dev.received = vec![0; size.outputs];
                size
            })
            .collect();
        drop(st);
        self.inputs = sizes.iter().map(|s| vec![0; s.inputs]).collect();
        self.outputs = sizes.iter().map(|s| vec![0; s.outputs]).collect();
        self.sizes = sizes.clone();
        self.mapped = true;
        Ok(sizes)
    }

    fn request_state(&mut self, state: AlState) -> LinkResult<()> {
        let mapped = self.mapped;
        let mut st = self.segment()?;
        let reject = st.reject_state;
        for dev in &mut st.devices {
            match reject {
                Some((target, code)) if target == state => dev.refuse(code.0),
                _ => dev.goto(state, mapped),
            }
        }
        Ok(())
    }

    fn read_states(&mut self) -> LinkResult<Vec<SlaveState>> {
        let st = self.segment()?;
        Ok(st
            .devices
            .iter()
            .enumerate()
            .map(|(i, dev)| {
                SlaveState::new(
                    SlavePos::from(i as u16),
                    dev.state,
                    dev.error,
                    AlStatusCode(dev.al_status),
                )
            })
            .collect())
    }

    fn request_slave_state(&mut self, slave: SlavePos, state: AlState, ack: bool)
        -> LinkResult<()>
    {
        let mapped = self.mapped;
        let mut st = self.segment()?;
        let dev = device(&mut st, slave)?;
        if dev.error && !ack {
            return Ok(());
        }
        dev.goto(state, mapped);
        Ok(())
    }

    fn reconfigure_slave(&mut self, slave: SlavePos) -> LinkResult<bool> {
        let expected = self.sizes.get(slave.index()).copied();
        let applied = self.applied.get(&slave).cloned();
        let mut st = self.segment()?;
        let dev = device(&mut st, slave)?;
        if let Some((rx, tx)) = applied {
            dev.rx_assign = rx;
            dev.tx_assign = tx;
        }
        if Some(dev.image()) != expected {
            return Ok(false);
        }
        dev.state = Some(AlState::SafeOp);
        dev.error = false;
        dev.al_status = 0;
        Ok(true)
    }

    fn recover_slave(&mut self, slave: SlavePos) -> LinkResult<bool> {
        let mut st = self.segment()?;
        Ok(st
            .devices
            .get_mut(slave.index())
            .map_or(false, |dev| dev.state.is_some()))
    }

    fn exchange(&mut self) -> LinkResult<u16> {
        if !self.open {
            return Err(LinkError::Rejected("link is closed".into()));
        }
        let mut st = self.sim.state();
        st.exchanges += 1;
        if !st.link_up {
            return Ok(0);
        }
        if st.devices.iter().all(|dev| dev.state == Some(AlState::Op) && !dev.error) {
            st.op_exchanges += 1;
        }
        let mut wkc = 0;
        for (i, dev) in st.devices.iter_mut().enumerate() {
            let (inputs, outputs) = match (self.inputs.get_mut(i), self.outputs.get(i)) {
                (Some(inp), Some(out)) => (inp, out),
                _ => continue,
            };
            match dev.state {
                Some(AlState::Op) if !dev.error => {
                    let n = dev.received.len().min(outputs.len());
                    dev.received[..n].copy_from_slice(&outputs[..n]);
                    if !outputs.is_empty() {
                        wkc += 2;
                    }
                }
                Some(AlState::Op) | Some(AlState::SafeOp) => {}
                _ => continue,
            }
            match dev.spec.input_mode {
                InputMode::Static => {}
                InputMode::Loopback => {
                    let n = dev.inputs.len().min(dev.received.len());
                    let (inp, rcv) = (&mut dev.inputs, &dev.received);
                    inp[..n].copy_from_slice(&rcv[..n]);
                }
                InputMode::Counter => {
                    dev.counter = dev.counter.wrapping_add(1);
                    let c = dev.counter;
                    dev.inputs.iter_mut().for_each(|b| *b = c);
                }
            }
            let n = inputs.len().min(dev.inputs.len());
            inputs[..n].copy_from_slice(&dev.inputs[..n]);
            if !inputs.is_empty() {
                wkc += 1;
            }
        }
        Ok(wkc)
    }

    fn expected_wkc(&self) -> u16 {
        self.sizes
            .iter()
            .map(|s| (if s.outputs > 0 { 2 } else { 0 }) + (if s.inputs > 0 { 1 } else { 0 }))
            .sum()
    }

    fn inputs(&self, slave: SlavePos) -> &[u8] {
        match self.inputs.get(slave.index()) {
            Some(data) => data,
            None => &[],
        }
    }

    fn outputs_mut(&mut self, slave: SlavePos) -> &mut [u8] {
        match self.outputs.get_mut(slave.index()) {
            Some(data) => data,
            None => &mut [],
        }
    }

    fn sdo_read(&mut self, slave: SlavePos, index: u16, subindex: u8, buf: &mut [u8])
        -> LinkResult<usize>
    {
        let delay = self.segment()?.sdo_delay;
        if delay > Duration::from_micros(0) {
            thread::sleep(delay);
        }
        let mut st = self.segment()?;
        let dev = device(&mut st, slave)?;
        let abort = |code| LinkError::SdoAbort { slave, index, subindex, code };
        if dev.state < Some(AlState::PreOp) {
            return Err(abort(ABORT_WRONG_STATE));
        }
        let spec = &dev.spec;
        let data: Vec<u8> = match (index, subindex) {
            (0x1000, 0) => spec.device_type.to_le_bytes().to_vec(),
            (0x1008, 0) => spec.name.as_bytes().to_vec(),
            (0x1009, 0) => spec.hw_version.as_bytes().to_vec(),
            (0x100A, 0) => spec.sw_version.as_bytes().to_vec(),
            (0x1018, 0) => vec![4],
            (0x1018, 1) => spec.id.vendor_id.to_le_bytes().to_vec(),
            (0x1018, 2) => spec.id.product_code.to_le_bytes().to_vec(),
            (0x1018, 3) => spec.rev.revision_number.to_le_bytes().to_vec(),
            (0x1018, 4) => spec.rev.serial_number.to_le_bytes().to_vec(),
            (0x1C12, _) | (0x1C13, _) => {
                let assigned = if index == 0x1C12 { &dev.rx_assign } else { &dev.tx_assign };
                match subindex {
                    0 => vec![assigned.len() as u8],
                    n => match assigned.get(usize::from(n) - 1) {
                        Some(idx) => idx.to_le_bytes().to_vec(),
                        None => return Err(abort(ABORT_NO_SUBINDEX)),
                    },
                }
            }
            _ => {
                let pdo = spec.rx_pdos.get(&index).or_else(|| spec.tx_pdos.get(&index));
                match (pdo, subindex) {
                    (None, _) => return Err(abort(ABORT_NO_OBJECT)),
                    (Some(list), 0) => vec![list.len() as u8],
                    (Some(list), n) => match list.get(usize::from(n) - 1) {
                        Some(entry) => entry.to_raw().to_le_bytes().to_vec(),
                        None => return Err(abort(ABORT_NO_SUBINDEX)),
                    },
                }
            }
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut st = self.sim.state();
            st.open_links = st.open_links.saturating_sub(1);
            debug!("SIM: link closed");
        }
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(p: u16) -> SlavePos {
        SlavePos::from(p)
    }

    #[test]
    fn image_sizes_follow_assignment() {
        let sim = SimBus::new()
            .with_device(SimDevice::ek1100())
            .with_device(SimDevice::el1008())
            .with_device(SimDevice::el3104())
            .with_device(SimDevice::io_module());
        let mut link = sim.open("sim0").unwrap();
        assert_eq!(link.scan().unwrap().len(), 4);
        link.apply_pdo_assignment(pos(3), &[PdoIdx(0x1601)], &[PdoIdx(0x1A00), PdoIdx(0x1A01)])
            .unwrap();
        let sizes = link.map_process_data().unwrap();
        assert_eq!(
            sizes,
            vec![
                ImageSize::new(0, 0),
                ImageSize::new(1, 0),
                ImageSize::new(16, 0),
                ImageSize::new(3, 2),
            ]
        );
        assert_eq!(link.expected_wkc(), 1 + 1 + 3);
    }

    #[test]
    fn invalid_assignment_is_refused() {
        let sim = SimBus::new().with_device(SimDevice::io_module());
        let mut link = sim.open("sim0").unwrap();
        link.scan().unwrap();
        let err = link.apply_pdo_assignment(pos(0), &[PdoIdx(0x1605)], &[]).unwrap_err();
        assert!(matches!(err, LinkError::SdoAbort { index: 0x1C12, subindex: 1, .. }));
        sim.reject_mapping(pos(0), true);
        assert!(link.apply_pdo_assignment(pos(0), &[PdoIdx(0x1600)], &[]).is_err());
    }

    #[test]
    fn states_and_exchange() {
        let sim = SimBus::new()
            .with_device(SimDevice::io_module().input_mode(InputMode::Loopback));
        let mut link = sim.open("sim0").unwrap();
        link.scan().unwrap();
        link.request_state(AlState::Op).unwrap();
        assert!(link.read_states().unwrap()[0].error);
        link.map_process_data().unwrap();
        link.request_state(AlState::SafeOp).unwrap();
        link.request_state(AlState::Op).unwrap();
        assert!(link.read_states().unwrap()[0].is(AlState::Op));

        link.outputs_mut(pos(0))[0] = 0x5A;
        assert_eq!(link.exchange().unwrap(), 3);
        assert_eq!(sim.transmitted(pos(0)), vec![0x5A]);
        link.exchange().unwrap();
        assert_eq!(link.inputs(pos(0)), &[0x5A]);

        sim.disconnect();
        assert_eq!(link.exchange().unwrap(), 0);
        assert!(link.read_states().is_err());
    }

    #[test]
    fn close_releases_adapter() {
        let sim = SimBus::new().with_device(SimDevice::io_module());
        assert!(sim.open("eth9").is_err());
        let mut link = sim.open("sim0").unwrap();
        let other = sim.open("sim0").unwrap();
        assert_eq!(sim.open_links(), 2);
        link.close();
        link.close();
        drop(other);
        assert_eq!(sim.open_links(), 0);
        assert!(link.scan().is_err());
    }
}
