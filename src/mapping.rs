// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The PDO mapping document.
//!
//! ```json
//! {
//!   "network": { "adapter": "eth1", "cycle_ms": 1.0 },
//!   "default": { "rx_pdo": ["0x1600"], "tx_pdo": ["0x1A00"] },
//!   "slaves":  { "0": { "rx_pdo": ["0x1601"], "tx_pdo": ["0x1A01"] } }
//! }
//! ```
//!
//! Slaves without an explicit entry fall back to `default`; without that,
//! they keep the assignment stored in their EEPROM.

use crate::types::{Error, PdoIdx, Result, SlavePos};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

/// Receive (output) and transmit (input) PDOs selected for a slave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdoAssignment {
    #[serde(default)]
    pub rx_pdo: Vec<PdoIdx>,
    #[serde(default)]
    pub tx_pdo: Vec<PdoIdx>,
}

impl PdoAssignment {
    pub fn new(rx_pdo: Vec<PdoIdx>, tx_pdo: Vec<PdoIdx>) -> Self {
        PdoAssignment { rx_pdo, tx_pdo }
    }

    fn validate(&self, owner: &str) -> Result<()> {
        if let Some(idx) = self.rx_pdo.iter().find(|idx| !idx.is_rx()) {
            return Err(Error::Configuration(format!(
                "{}: {} is not a receive PDO (0x1600..0x17FF)",
                owner, idx
            )));
        }
        if let Some(idx) = self.tx_pdo.iter().find(|idx| !idx.is_tx()) {
            return Err(Error::Configuration(format!(
                "{}: {} is not a transmit PDO (0x1A00..0x1BFF)",
                owner, idx
            )));
        }
        Ok(())
    }
}

/// Network section of the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub cycle_ms: Option<f64>,
}

impl NetworkSettings {
    pub fn cycle_time(&self) -> Option<Duration> {
        self.cycle_ms.map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    fn validate(&self) -> Result<()> {
        match self.cycle_ms {
            Some(ms) if !(ms.is_finite() && ms > 0.0) => Err(Error::Configuration(format!(
                "network: cycle_ms must be a positive number, got {}",
                ms
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    network: NetworkSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<PdoAssignment>,
    #[serde(default)]
    slaves: BTreeMap<String, PdoAssignment>,
}

/// Validated mapping document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdoMapping {
    network: NetworkSettings,
    default: Option<PdoAssignment>,
    slaves: BTreeMap<SlavePos, PdoAssignment>,
}

impl PdoMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let doc: Document = serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("malformed mapping document: {}", e)))?;
        Self::from_document(doc)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    fn from_document(doc: Document) -> Result<Self> {
        doc.network.validate()?;
        if let Some(default) = &doc.default {
            default.validate("default")?;
        }
        let mut slaves = BTreeMap::new();
        for (key, assignment) in doc.slaves {
            let pos: u16 = key.trim().parse().map_err(|_| {
                Error::Configuration(format!("slaves: '{}' is not a slave position", key))
            })?;
            assignment.validate(&format!("slave {}", pos))?;
            slaves.insert(SlavePos::from(pos), assignment);
        }
        Ok(PdoMapping {
            network: doc.network,
            default: doc.default,
            slaves,
        })
    }

    pub fn to_json_string(&self) -> Result<String> {
        let doc = Document {
            network: self.network.clone(),
            default: self.default.clone(),
            slaves: self
                .slaves
                .iter()
                .map(|(pos, a)| (pos.to_string(), a.clone()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }

    pub fn set_network(&mut self, network: NetworkSettings) -> Result<()> {
        network.validate()?;
        self.network = network;
        Ok(())
    }

    pub fn default_assignment(&self) -> Option<&PdoAssignment> {
        self.default.as_ref()
    }

    pub fn set_default(&mut self, assignment: Option<PdoAssignment>) -> Result<()> {
        if let Some(a) = &assignment {
            a.validate("default")?;
        }
        self.default = assignment;
        Ok(())
    }

    pub fn set_assignment(&mut self, slave: SlavePos, assignment: PdoAssignment) -> Result<()> {
        assignment.validate(&format!("slave {}", slave))?;
        self.slaves.insert(slave, assignment);
        Ok(())
    }

    /// Assignment to apply to `slave`: its own entry, else the default.
    pub fn assignment(&self, slave: SlavePos) -> Option<&PdoAssignment> {
        self.slaves.get(&slave).or(self.default.as_ref())
    }

    /// Whether the document accounts for a slave at this position.
    pub fn covers(&self, slave: SlavePos) -> bool {
        self.slaves.is_empty() || self.assignment(slave).is_some()
    }

    pub fn slaves(&self) -> impl Iterator<Item = (SlavePos, &PdoAssignment)> {
        self.slaves.iter().map(|(pos, a)| (*pos, a))
    }
}
