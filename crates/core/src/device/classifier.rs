//! Device classification from advertisement data
//!
//! Matchers are evaluated in order and the first hit wins. Service-identifier
//! matchers come first because they are exact; keyword matchers are a
//! heuristic over the advertised names and only apply when no service matched.

use super::{Advertisement, DeviceDescriptor, DeviceRole};
use crate::constants::service_uuids;
use tracing::debug;
use uuid::Uuid;

/// Name fragments identifying pulse oximeters
pub const OXIMETER_KEYWORDS: &[&str] = &[
    "berry",
    "bm1000",
    "bm2000",
    "jumper",
    "jpd-",
    "viatom",
    "wellue",
    "o2ring",
    "checkme",
    "oxyfit",
    "oxysmart",
    "pc-60",
    "pulse",
    "oximeter",
    "oxi",
    "spo2",
];

/// Name fragments identifying heart-rate straps and bands
pub const HR_MONITOR_KEYWORDS: &[&str] = &[
    "heart",
    "hr",
    "polar",
    "garmin",
    "wahoo",
    "tickr",
    "suunto",
    "coospo",
    "magene",
    "decathlon",
    "sensor",
    "monitor",
];

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exact match of an advertised service identifier
    ServiceId { service: Uuid, role: DeviceRole },
    /// Case-insensitive substring match over the name fields
    Keyword {
        keywords: &'static [&'static str],
        role: DeviceRole,
    },
}

impl Matcher {
    pub fn matches(&self, ad: &Advertisement) -> Option<DeviceRole> {
        match self {
            Matcher::ServiceId { service, role } => {
                ad.services.contains(service).then_some(*role)
            }
            Matcher::Keyword { keywords, role } => {
                let name = ad.searchable_name().to_lowercase();
                if name.is_empty() {
                    return None;
                }
                keywords
                    .iter()
                    .any(|keyword| name.contains(keyword))
                    .then_some(*role)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    matchers: Vec<Matcher>,
}

impl Default for DeviceClassifier {
    fn default() -> Self {
        Self::new(vec![
            Matcher::ServiceId {
                service: service_uuids::FIVE_BYTE_SERVICE,
                role: DeviceRole::PulseOx,
            },
            Matcher::ServiceId {
                service: service_uuids::FRAMED_SERVICE,
                role: DeviceRole::PulseOx,
            },
            Matcher::ServiceId {
                service: service_uuids::HEART_RATE_SERVICE,
                role: DeviceRole::HrMonitor,
            },
            Matcher::Keyword {
                keywords: OXIMETER_KEYWORDS,
                role: DeviceRole::PulseOx,
            },
            Matcher::Keyword {
                keywords: HR_MONITOR_KEYWORDS,
                role: DeviceRole::HrMonitor,
            },
        ])
    }
}

impl DeviceClassifier {
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Self { matchers }
    }

    pub fn classify(&self, ad: &Advertisement) -> DeviceRole {
        let role = self
            .matchers
            .iter()
            .find_map(|matcher| matcher.matches(ad))
            .unwrap_or(DeviceRole::Unknown);
        debug!("Classified {} ({:?}) as {}", ad.id, ad.searchable_name(), role);
        role
    }

    /// Classify and keep only devices playing `target`
    pub fn describe_if(&self, ad: &Advertisement, target: DeviceRole) -> Option<DeviceDescriptor> {
        let role = self.classify(ad);
        (role == target && role != DeviceRole::Unknown)
            .then(|| DeviceDescriptor::from_advertisement(ad, role))
    }
}
