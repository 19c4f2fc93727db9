// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! CoE helpers used by discovery.

use crate::convert::sdo_bytes_to_string;
use crate::link::{Link, LinkResult, SlaveInfo};
use crate::types::{ImageSize, PdoDescription, PdoEntry, PdoIdx, SlaveDescriptor, SlavePos};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::ops::RangeInclusive;

pub const SM2_ASSIGN: u16 = 0x1C12;
pub const SM3_ASSIGN: u16 = 0x1C13;

const RX_PROBE: RangeInclusive<u16> = 0x1600..=0x160F;
const TX_PROBE: RangeInclusive<u16> = 0x1A00..=0x1A0F;

fn read_u8<L: Link + ?Sized>(link: &mut L, slave: SlavePos, index: u16, sub: u8) -> LinkResult<u8> {
    let mut buf = [0; 1];
    link.sdo_read(slave, index, sub, &mut buf)?;
    Ok(buf[0])
}

fn read_u16<L: Link + ?Sized>(link: &mut L, slave: SlavePos, index: u16, sub: u8) -> LinkResult<u16> {
    let mut buf = [0; 2];
    link.sdo_read(slave, index, sub, &mut buf)?;
    Ok(LE::read_u16(&buf))
}

fn read_u32<L: Link + ?Sized>(link: &mut L, slave: SlavePos, index: u16, sub: u8) -> LinkResult<u32> {
    let mut buf = [0; 4];
    link.sdo_read(slave, index, sub, &mut buf)?;
    Ok(LE::read_u32(&buf))
}

/// Reads a visible string object such as 0x1008 (device name).
pub fn read_string<L: Link + ?Sized>(link: &mut L, slave: SlavePos, index: u16) -> Option<String> {
    let mut buf = [0; 64];
    let n = link.sdo_read(slave, index, 0, &mut buf).ok()?;
    Some(sdo_bytes_to_string(&buf[..n])).filter(|s| !s.is_empty())
}

/// Reads the entries mapped into one PDO.
pub fn read_pdo<L: Link + ?Sized>(link: &mut L, slave: SlavePos, pdo: PdoIdx) -> LinkResult<PdoDescription> {
    let count = read_u8(link, slave, pdo.0, 0)?;
    let entries = (1..=count)
        .map(|sub| read_u32(link, slave, pdo.0, sub).map(PdoEntry::from_raw))
        .collect::<LinkResult<Vec<_>>>()?;
    Ok(PdoDescription::new(pdo, entries))
}

/// Reads a sync manager PDO assignment (0x1C12 or 0x1C13) with the
/// contents of every assigned PDO.
pub fn read_assignment<L: Link + ?Sized>(
    link: &mut L,
    slave: SlavePos,
    sm_index: u16,
) -> LinkResult<Vec<PdoDescription>> {
    let count = read_u8(link, slave, sm_index, 0)?;
    let mut pdos = Vec::with_capacity(usize::from(count));
    for sub in 1..=count {
        let idx = PdoIdx(read_u16(link, slave, sm_index, sub)?);
        pdos.push(read_pdo(link, slave, idx)?);
    }
    Ok(pdos)
}

/// Probes which PDO objects of a range exist on the slave.
pub fn available_pdos<L: Link + ?Sized>(
    link: &mut L,
    slave: SlavePos,
    range: RangeInclusive<u16>,
) -> Vec<PdoIdx> {
    range
        .filter(|idx| read_u8(link, slave, *idx, 0).is_ok())
        .map(PdoIdx)
        .collect()
}

/// Collects everything discovery reports about a scanned slave.  Failed
/// optional reads leave the respective fields empty.
pub fn describe_slave<L: Link + ?Sized>(link: &mut L, info: &SlaveInfo, image: ImageSize) -> SlaveDescriptor {
    let pos = info.position;
    SlaveDescriptor {
        position: pos,
        name: info.name.clone(),
        id: info.id,
        rev: info.rev,
        al_state: info.al_state,
        device_name: read_string(link, pos, 0x1008),
        hw_version: read_string(link, pos, 0x1009),
        sw_version: read_string(link, pos, 0x100A),
        image,
        rx_assignment: read_assignment(link, pos, SM2_ASSIGN).unwrap_or_default(),
        tx_assignment: read_assignment(link, pos, SM3_ASSIGN).unwrap_or_default(),
        available_rx: available_pdos(link, pos, RX_PROBE),
        available_tx: available_pdos(link, pos, TX_PROBE),
    }
}
