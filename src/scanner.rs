//! Scanner turning a raw advertisement feed into a deduplicated registry of
//! classified automotive devices.
//!
//! Classification and the automotive pass/fail gate come from one function,
//! [classify]: a name keyword match decides the device type with priority
//! `elm` > `obd` > `vlink` > any other keyword, and an advertised OBD2
//! service identifier alone classifies a nameless dongle. A device passes the
//! automotive filter when either signal matches.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crate::ObdResult;
use crate::transport::{Advertisement, DiscoveryBackend};

/// Name fragments of known automotive adapters and common clone brands
pub const AUTOMOTIVE_KEYWORDS: &[&str] = &[
    "obd", "elm", "vlink", "obdii", "obdlink", "scantool", "veepeak", "bafx", "foseal", "panlong",
    "konnwei",
];

/// Service identifiers advertised by common OBD2 BLE adapters
pub const OBD2_SERVICE_IDS: &[&str] = &[
    "0000fff0-0000-1000-8000-00805f9b34fb",
    "0000ffe0-0000-1000-8000-00805f9b34fb",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
/// Classified type of a discovered device
pub enum DeviceType {
    /// ELM327 chipset adapter
    #[strum(serialize = "ELM327")]
    Elm327,
    /// Generic OBD2 adapter
    #[strum(serialize = "OBD2")]
    Obd2,
    /// VLink family adapter
    #[strum(serialize = "VLink")]
    VLink,
    /// Name matched an automotive keyword but no specific family
    #[strum(serialize = "Unknown Automotive")]
    UnknownAutomotive,
    /// Nothing automotive about it
    #[strum(serialize = "Unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of classifying one advertisement
pub struct Classification {
    /// Device type derived from name keywords or service identifiers
    pub device_type: DeviceType,
    /// Whether the device passes the automotive filter
    pub automotive: bool,
}

/// Classifies a device from its advertised name and service identifiers
pub fn classify(name: Option<&str>, service_ids: &[String]) -> Classification {
    let name_lower = name.map(str::to_lowercase);
    let keyword_hit = name_lower
        .as_deref()
        .is_some_and(|n| AUTOMOTIVE_KEYWORDS.iter().any(|k| n.contains(k)));
    let service_hit = service_ids
        .iter()
        .any(|id| OBD2_SERVICE_IDS.contains(&id.to_lowercase().as_str()));

    let device_type = if keyword_hit {
        let name = name_lower.as_deref().unwrap_or_default();
        if name.contains("elm") {
            DeviceType::Elm327
        } else if name.contains("obd") {
            DeviceType::Obd2
        } else if name.contains("vlink") {
            DeviceType::VLink
        } else {
            DeviceType::UnknownAutomotive
        }
    } else if service_hit {
        DeviceType::Obd2
    } else {
        DeviceType::Unknown
    };

    Classification {
        device_type,
        automotive: keyword_hit || service_hit,
    }
}

#[derive(Debug, Clone)]
/// One classified discovery result, scoped to a scan session
pub struct AutomotiveDevice {
    /// Device address, unique key within a scan
    pub address: String,
    /// Advertised name, if any
    pub name: Option<String>,
    /// Signal strength in dBm, if reported
    pub rssi: Option<i16>,
    /// Classified device type
    pub device_type: DeviceType,
    /// Manufacturer specific data blocks keyed by company ID
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised service identifiers
    pub service_ids: Vec<String>,
}

impl AutomotiveDevice {
    fn from_advertisement(adv: Advertisement) -> (Self, bool) {
        let classification = classify(adv.name.as_deref(), &adv.service_ids);
        (
            Self {
                address: adv.address,
                name: adv.name,
                rssi: adv.rssi,
                device_type: classification.device_type,
                manufacturer_data: adv.manufacturer_data,
                service_ids: adv.service_ids,
            },
            classification.automotive,
        )
    }

    /// Whether this device passes the automotive filter
    pub fn is_automotive(&self) -> bool {
        classify(self.name.as_deref(), &self.service_ids).automotive
    }
}

/// Scanner for automotive devices over a discovery capable transport
#[derive(Debug)]
pub struct DeviceScanner<B: DiscoveryBackend> {
    backend: B,
    discovered: HashMap<String, AutomotiveDevice>,
}

impl<B: DiscoveryBackend> DeviceScanner<B> {
    /// Creates a scanner over `backend`
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            discovered: HashMap::new(),
        }
    }

    /// Runs one discovery pass of `timeout` and returns the observed
    /// devices, restricted to automotive ones when `automotive_only` is set.
    ///
    /// Prior results are cleared; the latest advertisement for an address
    /// overwrites any earlier sighting.
    pub fn scan(
        &mut self,
        timeout: Duration,
        automotive_only: bool,
    ) -> ObdResult<Vec<AutomotiveDevice>> {
        self.discovered.clear();
        log::info!("starting device scan ({timeout:?})");
        let Self {
            backend,
            discovered,
        } = self;
        backend.discover(timeout, &mut |adv| {
            let (device, _) = AutomotiveDevice::from_advertisement(adv);
            discovered.insert(device.address.clone(), device);
        })?;
        let mut devices: Vec<AutomotiveDevice> = self.discovered.values().cloned().collect();
        if automotive_only {
            devices.retain(AutomotiveDevice::is_automotive);
        }
        log::info!("scan complete, {} device(s)", devices.len());
        Ok(devices)
    }

    /// Runs discovery for `duration`, invoking `callback` synchronously for
    /// every advertisement classified as automotive.
    ///
    /// A panicking callback is caught and logged so one bad observer cannot
    /// abort the scan. The callback is scoped to this call.
    pub fn scan_continuous<F>(&mut self, duration: Duration, mut callback: F) -> ObdResult<()>
    where
        F: FnMut(&AutomotiveDevice),
    {
        log::info!("starting continuous scan for {duration:?}");
        let Self {
            backend,
            discovered,
        } = self;
        backend.discover(duration, &mut |adv| {
            let (device, automotive) = AutomotiveDevice::from_advertisement(adv);
            discovered.insert(device.address.clone(), device.clone());
            if automotive
                && catch_unwind(AssertUnwindSafe(|| callback(&device))).is_err()
            {
                log::error!("scan callback panicked for {}", device.address);
            }
        })?;
        Ok(())
    }

    /// A previously discovered device, by address
    pub fn device_by_address(&self, address: &str) -> Option<&AutomotiveDevice> {
        self.discovered.get(address)
    }

    /// All discovered devices of `device_type`
    pub fn devices_by_type(&self, device_type: DeviceType) -> Vec<&AutomotiveDevice> {
        self.discovered
            .values()
            .filter(|d| d.device_type == device_type)
            .collect()
    }

    /// Every device seen in the current scan session
    pub fn discovered_devices(&self) -> Vec<&AutomotiveDevice> {
        self.discovered.values().collect()
    }

    /// Clears the discovered device set
    pub fn clear_discovered_devices(&mut self) {
        self.discovered.clear();
    }
}
