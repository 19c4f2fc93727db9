// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use derive_new::new;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, io, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}{}", .diagnostics.as_ref().map(|d| format!("\n{}", d)).unwrap_or_default())]
    Connection {
        message: String,
        diagnostics: Option<Diagnostics>,
    },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Slave {position}: buffer holds {actual} bytes, mapping implies {expected}")]
    BufferLength {
        position: SlavePos,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid AL state 0x{0:X}")]
    InvalidAlState(u8),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Configuration,
    Communication,
    Io,
}

impl Error {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Configuration(_) | Error::BufferLength { .. } | Error::Json(_) => {
                ErrorKind::Configuration
            }
            Error::Communication(_) | Error::InvalidAlState(_) => ErrorKind::Communication,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Per-slave diagnostics attached to a failed connection attempt.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Error::Connection { diagnostics, .. } => diagnostics.as_ref(),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Position of a slave in the ring, counted from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlavePos(u16);

impl SlavePos {
    pub const fn new(pos: u16) -> Self {
        SlavePos(pos)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for SlavePos {
    fn from(pos: u16) -> Self {
        SlavePos(pos)
    }
}

impl From<SlavePos> for u16 {
    fn from(pos: SlavePos) -> Self {
        pos.0
    }
}

impl fmt::Display for SlavePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An EtherCAT slave identification, consisting of vendor ID and product code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, new)]
pub struct SlaveId {
    pub vendor_id: u32,
    pub product_code: u32,
}

/// An EtherCAT slave revision identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, new)]
pub struct SlaveRev {
    pub revision_number: u32,
    pub serial_number: u32,
}

/// Application layer state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AlState {
    Init = 1,
    PreOp = 2,
    Boot = 3,
    SafeOp = 4,
    Op = 8,
}

impl TryFrom<u8> for AlState {
    type Error = Error;

    fn try_from(st: u8) -> Result<Self> {
        match st & 0x0F {
            1 => Ok(AlState::Init),
            2 => Ok(AlState::PreOp),
            3 => Ok(AlState::Boot),
            4 => Ok(AlState::SafeOp),
            8 => Ok(AlState::Op),
            _ => Err(Error::InvalidAlState(st)),
        }
    }
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            AlState::Init => "INIT",
            AlState::PreOp => "PRE-OP",
            AlState::Boot => "BOOT",
            AlState::SafeOp => "SAFE-OP",
            AlState::Op => "OP",
        })
    }
}

/// AL status code register value (0x0134) reported by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct AlStatusCode(pub u16);

impl AlStatusCode {
    pub const NONE: AlStatusCode = AlStatusCode(0x0000);
    pub const INVALID_STATE_CHANGE: AlStatusCode = AlStatusCode(0x0011);
    pub const SM_WATCHDOG: AlStatusCode = AlStatusCode(0x001B);
    pub const INVALID_OUTPUT_MAPPING: AlStatusCode = AlStatusCode(0x0025);

    pub fn is_error(self) -> bool {
        self.0 != 0
    }

    pub fn description(self) -> &'static str {
        match self.0 {
            0x0000 => "No error",
            0x0001 => "Unspecified error",
            0x0011 => "Invalid requested state change",
            0x0012 => "Unknown requested state",
            0x0013 => "Bootstrap not supported",
            0x0014 => "No valid firmware",
            0x0015 => "Invalid mailbox configuration (BOOT)",
            0x0016 => "Invalid mailbox configuration (PREOP)",
            0x0017 => "Invalid sync manager configuration",
            0x0018 => "No valid inputs available",
            0x0019 => "No valid outputs",
            0x001A => "Synchronization error",
            0x001B => "Sync manager watchdog",
            0x001C => "Invalid sync manager types",
            0x001D => "Invalid output configuration",
            0x001E => "Invalid input configuration",
            0x001F => "Invalid watchdog configuration",
            0x0020 => "Slave needs cold start",
            0x0021 => "Slave needs INIT",
            0x0022 => "Slave needs PREOP",
            0x0023 => "Slave needs SAFEOP",
            0x0024 => "Invalid input mapping",
            0x0025 => "Invalid output mapping",
            0x0026 => "Inconsistent settings",
            0x0027 => "FreeRun not supported",
            0x0028 => "SyncMode not supported",
            0x0029 => "FreeRun needs 3-buffer mode",
            0x002A => "Background watchdog",
            0x002B => "No valid inputs and outputs",
            0x002C => "Fatal sync error",
            0x002D => "No sync error",
            0x002E => "Invalid input FMMU configuration",
            0x0030 => "Invalid DC sync configuration",
            0x0031 => "Invalid DC latch configuration",
            0x0032 => "PLL error",
            0x0033 => "DC sync I/O error",
            0x0034 => "DC sync timeout",
            0x0035 => "DC invalid sync cycle time",
            0x0036 => "DC sync0 cycle time",
            0x0037 => "DC sync1 cycle time",
            0x0041 => "MBX_AOE",
            0x0042 => "MBX_EOE",
            0x0043 => "MBX_COE",
            0x0044 => "MBX_FOE",
            0x0045 => "MBX_SOE",
            0x004F => "MBX_VOE",
            0x0050 => "EEPROM no access",
            0x0051 => "EEPROM error",
            0x0060 => "Slave restarted locally",
            0x0061 => "Device identification value updated",
            0x00F0 => "Application controller available",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for AlStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.0, self.description())
    }
}

/// State of a single slave as read back from the link.
///
/// `state` is `None` when the slave did not answer at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, new)]
pub struct SlaveState {
    pub position: SlavePos,
    pub state: Option<AlState>,
    pub error: bool,
    pub al_status: AlStatusCode,
}

impl SlaveState {
    pub fn is(&self, state: AlState) -> bool {
        self.state == Some(state) && !self.error
    }
}

/// One line of a diagnostic report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveStatus {
    pub position: SlavePos,
    pub name: String,
    pub state: Option<AlState>,
    pub error: bool,
    pub al_status: AlStatusCode,
    pub input_bytes: usize,
    pub output_bytes: usize,
}

impl fmt::Display for SlaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.name.is_empty() {
            format!("slave {}", self.position)
        } else {
            self.name.clone()
        };
        write!(f, "  [{}] {}: state=", self.position, name)?;
        match self.state {
            Some(st) => write!(f, "{}", st)?,
            None => f.write_str("NONE")?,
        }
        if self.error {
            f.write_str("+ERR")?;
        }
        if self.al_status.is_error() {
            write!(f, ", AL={}", self.al_status)?;
        } else {
            f.write_str(", AL=N/A")?;
        }
        write!(f, ", Out={}B, In={}B", self.output_bytes, self.input_bytes)
    }
}

/// Per-slave state report attached to connection errors and bus faults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics(pub Vec<SlaveStatus>);

impl Diagnostics {
    pub fn slave(&self, position: SlavePos) -> Option<&SlaveStatus> {
        self.0.iter().find(|s| s.position == position)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("No slave state info available.");
        }
        f.write_str("Slave details:")?;
        for line in &self.0 {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

/// Byte lengths of a slave's process data images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, new)]
pub struct ImageSize {
    pub inputs: usize,
    pub outputs: usize,
}

/// Object index of a PDO (0x1600.. receive, 0x1A00.. transmit).
///
/// Serialized as a `"0x1600"` style string; deserialized from such strings
/// or from plain integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "PdoIdRepr")]
pub struct PdoIdx(pub u16);

impl PdoIdx {
    pub const fn new(idx: u16) -> Self {
        PdoIdx(idx)
    }

    pub fn is_rx(self) -> bool {
        (0x1600..=0x17FF).contains(&self.0)
    }

    pub fn is_tx(self) -> bool {
        (0x1A00..=0x1BFF).contains(&self.0)
    }
}

impl fmt::Display for PdoIdx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl FromStr for PdoIdx {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::convert::parse_object_index(s)
            .map(PdoIdx)
            .ok_or_else(|| Error::Configuration(format!("invalid PDO identifier '{}'", s)))
    }
}

impl From<PdoIdx> for String {
    fn from(idx: PdoIdx) -> Self {
        idx.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PdoIdRepr {
    Text(String),
    Number(i64),
}

impl TryFrom<PdoIdRepr> for PdoIdx {
    type Error = String;

    fn try_from(repr: PdoIdRepr) -> std::result::Result<Self, String> {
        match repr {
            PdoIdRepr::Text(s) => s.parse().map_err(|e: Error| e.to_string()),
            PdoIdRepr::Number(n) => u16::try_from(n)
                .map(PdoIdx)
                .map_err(|_| format!("PDO identifier {} out of range", n)),
        }
    }
}

/// One mapped object inside a PDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, new)]
pub struct PdoEntry {
    pub index: u16,
    pub subindex: u8,
    pub bit_len: u8,
}

impl PdoEntry {
    /// Decodes a CoE mapping entry (index 31..16, subindex 15..8, bits 7..0).
    pub fn from_raw(raw: u32) -> Self {
        PdoEntry {
            index: (raw >> 16) as u16,
            subindex: (raw >> 8) as u8,
            bit_len: raw as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        (u32::from(self.index) << 16) | (u32::from(self.subindex) << 8) | u32::from(self.bit_len)
    }
}

/// A PDO together with its mapped entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, new)]
pub struct PdoDescription {
    pub index: PdoIdx,
    pub entries: Vec<PdoEntry>,
}

impl PdoDescription {
    pub fn bit_len(&self) -> usize {
        self.entries.iter().map(|e| usize::from(e.bit_len)).sum()
    }
}

/// Everything discovery learns about one slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveDescriptor {
    pub position: SlavePos,
    pub name: String,
    pub id: SlaveId,
    pub rev: SlaveRev,
    pub al_state: Option<AlState>,
    pub device_name: Option<String>,
    pub hw_version: Option<String>,
    pub sw_version: Option<String>,
    pub image: ImageSize,
    pub rx_assignment: Vec<PdoDescription>,
    pub tx_assignment: Vec<PdoDescription>,
    pub available_rx: Vec<PdoIdx>,
    pub available_tx: Vec<PdoIdx>,
}

impl SlaveDescriptor {
    pub fn input_bytes(&self) -> usize {
        self.image.inputs
    }

    pub fn output_bytes(&self) -> usize {
        self.image.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn al_state_from_register() {
        assert_eq!(AlState::try_from(0x08).unwrap(), AlState::Op);
        assert_eq!(AlState::try_from(0x14).unwrap(), AlState::SafeOp);
        assert!(matches!(AlState::try_from(0x07), Err(Error::InvalidAlState(7))));
    }

    #[test]
    fn al_status_text() {
        assert_eq!(AlStatusCode(0x0011).description(), "Invalid requested state change");
        assert_eq!(AlStatusCode::SM_WATCHDOG.to_string(), "0x001B (Sync manager watchdog)");
        assert_eq!(AlStatusCode(0x7777).description(), "Unknown");
        assert!(!AlStatusCode::NONE.is_error());
    }

    #[test]
    fn pdo_entry_raw_layout() {
        let entry = PdoEntry::from_raw(0x6000_0110);
        assert_eq!(entry, PdoEntry::new(0x6000, 0x01, 0x10));
        assert_eq!(entry.to_raw(), 0x6000_0110);
    }

    #[test]
    fn pdo_idx_serde() {
        let idx: PdoIdx = serde_json::from_str("\"0x1A00\"").unwrap();
        assert_eq!(idx, PdoIdx(0x1A00));
        assert!(idx.is_tx());
        let idx: PdoIdx = serde_json::from_str("5632").unwrap();
        assert_eq!(idx, PdoIdx(0x1600));
        assert_eq!(serde_json::to_string(&idx).unwrap(), "\"0x1600\"");
        assert!(serde_json::from_str::<PdoIdx>("\"0xZZ\"").is_err());
        assert!(serde_json::from_str::<PdoIdx>("70000").is_err());
    }

    #[test]
    fn diagnostics_report() {
        let diag = Diagnostics(vec![SlaveStatus {
            position: SlavePos::new(1),
            name: "EL2008".into(),
            state: Some(AlState::SafeOp),
            error: true,
            al_status: AlStatusCode::SM_WATCHDOG,
            input_bytes: 0,
            output_bytes: 1,
        }]);
        assert_eq!(
            diag.to_string(),
            "Slave details:\n  [1] EL2008: state=SAFE-OP+ERR, AL=0x001B (Sync manager watchdog), Out=1B, In=0B"
        );
        assert_eq!(Diagnostics::default().to_string(), "No slave state info available.");
    }
}
