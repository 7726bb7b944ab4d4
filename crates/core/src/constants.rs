//! Global constants for Pulsewire

use std::time::Duration;
use uuid::Uuid;

/// GATT identifiers for the supported sensor families
pub mod service_uuids {
    use super::*;

    /// Five-byte oximeter service (BCI-style serial-over-GATT)
    pub const FIVE_BYTE_SERVICE: Uuid = uuid::uuid!("49535343-FE7D-4AE5-8FA9-9FAFD205E455");

    /// Five-byte oximeter notify characteristic
    pub const FIVE_BYTE_NOTIFY: Uuid = uuid::uuid!("49535343-1E4D-4BD9-BA61-23C647249616");

    /// Framed command/response oximeter service
    pub const FRAMED_SERVICE: Uuid = uuid::uuid!("14839AC4-7D7E-415C-9A42-167340CF2339");

    /// Framed protocol write characteristic (commands go here)
    pub const FRAMED_WRITE: Uuid = uuid::uuid!("8B00ACE7-EB0B-49B0-BBE9-9AEE0A26E1A3");

    /// Framed protocol notify characteristic (responses arrive here)
    pub const FRAMED_NOTIFY: Uuid = uuid::uuid!("0734594A-A8E7-4B1A-A6B1-CD5243059A57");

    /// Bluetooth SIG Heart Rate service (0x180D)
    pub const HEART_RATE_SERVICE: Uuid = uuid::uuid!("0000180D-0000-1000-8000-00805F9B34FB");

    /// Bluetooth SIG Heart Rate Measurement characteristic (0x2A37)
    pub const HEART_RATE_MEASUREMENT: Uuid = uuid::uuid!("00002A37-0000-1000-8000-00805F9B34FB");
}

/// Physiological validity ranges
pub mod ranges {
    /// Pulse rate accepted by every decoder (BPM)
    pub const PULSE_MIN: u16 = 25;
    pub const PULSE_MAX: u16 = 250;

    /// Oxygen saturation accepted by the oximeter decoders (%)
    pub const SPO2_MIN: u8 = 35;
    pub const SPO2_MAX: u8 = 100;

    /// Inter-beat intervals outside this range never enter a window (ms)
    pub const IBI_MIN_MS: f64 = 300.0;
    pub const IBI_MAX_MS: f64 = 2000.0;
}

/// Connection and lifecycle timing
pub mod timing {
    use super::*;

    /// Grace period before an unexpected disconnect ends the session
    pub const RECOVERY_WINDOW: Duration = Duration::from_secs(30);

    /// How long the radio survives with zero references
    pub const TEARDOWN_DEBOUNCE: Duration = Duration::from_millis(500);

    /// Single-byte streaming accumulator lifetime
    pub const STREAM_BUFFER_WINDOW: Duration = Duration::from_secs(5);

    /// Connection timeout
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Peripheral polling interval while scanning
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);
}

/// HRV timeframe parameters
pub mod hrv {
    use super::*;

    pub const QUICK_CAPACITY: usize = 60;
    pub const QUICK_MIN_INTERVALS: usize = 10;
    pub const QUICK_THROTTLE: Duration = Duration::from_millis(2000);

    pub const REAL_CAPACITY: usize = 300;
    pub const REAL_MIN_INTERVALS: usize = 60;
    pub const REAL_THROTTLE: Duration = Duration::from_millis(15000);
}
