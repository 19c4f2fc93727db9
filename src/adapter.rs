// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Enumeration of network adapters able to carry raw EtherCAT frames.

use crate::types::{Error, Result};
use derive_new::new;
use pnet_datalink::{self as datalink, MacAddr, NetworkInterface};
use serde::Serialize;
use std::path::Path;

/// A network interface as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, new)]
pub struct Adapter {
    pub name: String,
    pub description: String,
    pub is_usable: bool,
}

/// Link properties deciding whether an interface can host a segment.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LinkTraits {
    pub loopback: bool,
    pub point_to_point: bool,
    pub has_hw_addr: bool,
    pub wireless: bool,
    pub virtual_dev: bool,
}

impl LinkTraits {
    fn of(iface: &NetworkInterface) -> Self {
        let sys = Path::new("/sys/class/net").join(&iface.name);
        LinkTraits {
            loopback: iface.is_loopback(),
            point_to_point: iface.is_point_to_point(),
            has_hw_addr: iface.mac.map_or(false, |mac| mac != MacAddr::zero()),
            wireless: sys.join("wireless").exists() || sys.join("phy80211").exists(),
            virtual_dev: Path::new("/sys/devices/virtual/net").join(&iface.name).exists(),
        }
    }

    pub fn usable(&self) -> bool {
        !(self.loopback || self.point_to_point || self.wireless || self.virtual_dev)
            && self.has_hw_addr
    }
}

fn describe(iface: &NetworkInterface, traits: &LinkTraits) -> String {
    if !iface.description.is_empty() {
        return iface.description.clone();
    }
    let kind = if traits.loopback {
        "loopback"
    } else if traits.wireless {
        "wireless"
    } else if traits.virtual_dev {
        "virtual"
    } else if traits.point_to_point {
        "point-to-point"
    } else {
        "ethernet"
    };
    match iface.mac {
        Some(mac) => format!("{} ({})", kind, mac),
        None => kind.to_owned(),
    }
}

/// All interfaces known to the OS, usable or not.
pub fn enumerate() -> Vec<Adapter> {
    datalink::interfaces()
        .iter()
        .map(|iface| {
            let traits = LinkTraits::of(iface);
            Adapter::new(iface.name.clone(), describe(iface, &traits), traits.usable())
        })
        .collect()
}

/// Interfaces that can carry raw EtherCAT traffic.
pub fn list_adapters() -> Vec<Adapter> {
    enumerate().into_iter().filter(|a| a.is_usable).collect()
}

/// Picks an adapter by name, or the first usable one if no name is given.
pub fn resolve(adapters: &[Adapter], name: Option<&str>) -> Result<Adapter> {
    let found = match name {
        Some(name) => adapters.iter().find(|a| a.name == name),
        None => adapters.iter().find(|a| a.is_usable),
    };
    found.cloned().ok_or_else(|| {
        let available = adapters
            .iter()
            .filter(|a| a.is_usable)
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let what = match name {
            Some(name) => format!("Adapter '{}' not found", name),
            None => "No usable network adapter found".to_owned(),
        };
        Error::connection(format!("{}. Available: [{}]", what, available))
    })
}
