//! Sensor discovery model and advertisement classification

pub mod classifier;

pub use classifier::{DeviceClassifier, Matcher, HR_MONITOR_KEYWORDS, OXIMETER_KEYWORDS};

use crate::constants::service_uuids;
use crate::protocol::ProtocolTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of roles a discovered device can play
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceRole {
    PulseOx,
    HrMonitor,
    Unknown,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::PulseOx => "pulse-ox",
            DeviceRole::HrMonitor => "hr-monitor",
            DeviceRole::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pulse-ox" | "pulseox" | "oximeter" => Ok(DeviceRole::PulseOx),
            "hr-monitor" | "hr" | "heart-rate" => Ok(DeviceRole::HrMonitor),
            other => Err(format!("unknown device role: {}", other)),
        }
    }
}

/// Raw advertisement record as seen by the scanner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub local_name: Option<String>,
    pub services: BTreeSet<Uuid>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.insert(service);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name fields joined for keyword matching
    pub fn searchable_name(&self) -> String {
        [self.name.as_deref(), self.local_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A discovered device after classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub services: BTreeSet<Uuid>,
    pub rssi: Option<i16>,
    pub role: DeviceRole,
}

impl DeviceDescriptor {
    pub fn from_advertisement(ad: &Advertisement, role: DeviceRole) -> Self {
        Self {
            id: ad.id.clone(),
            name: ad.local_name.clone().or_else(|| ad.name.clone()),
            services: ad.services.clone(),
            rssi: ad.rssi,
            role,
        }
    }

    /// Wire protocol implied by the advertised services, if any
    pub fn protocol_hint(&self) -> Option<ProtocolTag> {
        if self.services.contains(&service_uuids::FRAMED_SERVICE) {
            Some(ProtocolTag::Framed)
        } else if self.services.contains(&service_uuids::FIVE_BYTE_SERVICE) {
            Some(ProtocolTag::FiveByte)
        } else if self.services.contains(&service_uuids::HEART_RATE_SERVICE) {
            Some(ProtocolTag::HeartRateService)
        } else {
            None
        }
    }

    /// Get a short display ID (first 8 characters)
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(8) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }

    /// Get display name or fallback to short ID
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("pulse-ox".parse::<DeviceRole>().unwrap(), DeviceRole::PulseOx);
        assert_eq!("HR-Monitor".parse::<DeviceRole>().unwrap(), DeviceRole::HrMonitor);
        assert!("toaster".parse::<DeviceRole>().is_err());
        assert_eq!(DeviceRole::HrMonitor.to_string(), "hr-monitor");
    }

    #[test]
    fn test_descriptor_prefers_local_name() {
        let ad = Advertisement::new("AA:BB:CC:DD:EE:FF")
            .with_name("generic")
            .with_local_name("O2Ring 1234");
        let descriptor = DeviceDescriptor::from_advertisement(&ad, DeviceRole::PulseOx);
        assert_eq!(descriptor.display_name(), "O2Ring 1234");
        assert_eq!(descriptor.short_id(), "AA:BB:CC");
    }

    #[test]
    fn test_protocol_hint() {
        let ad = Advertisement::new("dev").with_service(service_uuids::FRAMED_SERVICE);
        let descriptor = DeviceDescriptor::from_advertisement(&ad, DeviceRole::PulseOx);
        assert_eq!(descriptor.protocol_hint(), Some(ProtocolTag::Framed));

        let ad = Advertisement::new("dev");
        let descriptor = DeviceDescriptor::from_advertisement(&ad, DeviceRole::PulseOx);
        assert_eq!(descriptor.protocol_hint(), None);
    }
}
