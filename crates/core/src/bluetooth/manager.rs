//! Radio manager - btleplug adapter access, sensor links and the
//! per-connection notification loop

use super::events::BluetoothEvent;
use crate::constants::service_uuids;
use crate::device::{Advertisement, DeviceDescriptor, DeviceRole};
use crate::error::{BiosensorError, Result};
use crate::hrv::HrvEngine;
use crate::protocol::{Decoded, FramedCommand, ProtocolTag, SensorDecoder};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::Utc;
use futures::stream::BoxStream;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Liveness check interval, independent of command traffic
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the platform manager and the first adapter
pub struct RadioManager {
    _manager: Manager,
    adapter: Adapter,
}

impl RadioManager {
    pub async fn new() -> Result<Self> {
        info!("Initializing Bluetooth radio");

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BiosensorError::RadioUnavailable)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            _manager: manager,
            adapter,
        })
    }

    /// Creating a manager triggers the platform permission prompt where one exists
    pub async fn request_access() -> Result<bool> {
        match Manager::new().await {
            Ok(_) => Ok(true),
            Err(btleplug::Error::PermissionDenied) => {
                warn!("Bluetooth permission denied");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True when at least one adapter is present
    pub async fn is_radio_enabled() -> Result<bool> {
        let manager = Manager::new().await?;
        Ok(!manager.adapters().await?.is_empty())
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Unfiltered scan; classification needs advertisements that omit services
    pub async fn start_scan(&self) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BiosensorError::ScanFailed(e.to_string()))
    }

    pub async fn stop_scan(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Error stopping scan: {}", e);
        }
    }

    /// Advertisement records for every peripheral seen so far
    pub async fn advertisements(&self) -> Result<Vec<Advertisement>> {
        let mut records = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                records.push(Advertisement {
                    id: peripheral.id().to_string(),
                    name: None,
                    local_name: properties.local_name,
                    services: properties.services.into_iter().collect(),
                    rssi: properties.rssi,
                });
            }
        }
        Ok(records)
    }

    pub async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| BiosensorError::UnknownDevice(device_id.to_string()))
    }

    /// Connect, discover services, pick the wire protocol and subscribe
    pub async fn open_link(&self, descriptor: &DeviceDescriptor, timeout: Duration) -> Result<SensorLink> {
        let peripheral = self.find_peripheral(&descriptor.id).await?;
        debug!("Attempting to connect to {}", descriptor.short_id());
        time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| BiosensorError::Timeout(descriptor.id.clone()))?
            .map_err(|e| BiosensorError::connection(&descriptor.id, e))?;

        let (protocol, notify, write) = match Self::prepare(&peripheral, descriptor).await {
            Ok(parts) => parts,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };
        let notifications = peripheral.notifications().await?;

        info!("✅ Connected to {} ({}) using {}", descriptor.display_name(), descriptor.role, protocol);

        Ok(SensorLink {
            descriptor: descriptor.clone(),
            peripheral,
            protocol,
            notify,
            write,
            notifications,
            connected_at: Instant::now(),
        })
    }

    /// Discover services, pick the protocol and subscribe to its notify endpoint
    async fn prepare(
        peripheral: &Peripheral,
        descriptor: &DeviceDescriptor,
    ) -> Result<(ProtocolTag, Characteristic, Option<Characteristic>)> {
        peripheral
            .discover_services()
            .await
            .map_err(|e| BiosensorError::connection(&descriptor.id, format!("service discovery: {}", e)))?;

        let characteristics = peripheral.characteristics();
        let available: BTreeSet<Uuid> = characteristics.iter().map(|c| c.uuid).collect();
        let protocol = select_protocol(&available, descriptor.role).ok_or_else(|| {
            BiosensorError::MissingEndpoint {
                device: descriptor.id.clone(),
                what: "measurement characteristic",
            }
        })?;

        let (notify_uuid, write_uuid) = endpoints(protocol);
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let notify = find(notify_uuid).ok_or_else(|| BiosensorError::MissingEndpoint {
            device: descriptor.id.clone(),
            what: "notify characteristic",
        })?;
        let write = write_uuid.and_then(find);

        if !notify.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
            warn!("Characteristic {} on {} does not advertise notify", notify.uuid, descriptor.short_id());
        }
        peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| BiosensorError::connection(&descriptor.id, e))?;

        Ok((protocol, notify, write))
    }
}

/// Choose the protocol from the characteristics a device exposes.
/// Heart-rate monitors prefer the standard measurement characteristic;
/// oximeters prefer their vendor protocols.
pub fn select_protocol(available: &BTreeSet<Uuid>, role: DeviceRole) -> Option<ProtocolTag> {
    let framed = available.contains(&service_uuids::FRAMED_NOTIFY)
        && available.contains(&service_uuids::FRAMED_WRITE);
    let five_byte = available.contains(&service_uuids::FIVE_BYTE_NOTIFY);
    let heart_rate = available.contains(&service_uuids::HEART_RATE_MEASUREMENT);

    let order = match role {
        DeviceRole::HrMonitor => [
            (heart_rate, ProtocolTag::HeartRateService),
            (framed, ProtocolTag::Framed),
            (five_byte, ProtocolTag::FiveByte),
        ],
        _ => [
            (framed, ProtocolTag::Framed),
            (five_byte, ProtocolTag::FiveByte),
            (heart_rate, ProtocolTag::HeartRateService),
        ],
    };
    order.into_iter().find(|(present, _)| *present).map(|(_, tag)| tag)
}

/// Notify and optional write characteristic for a protocol
fn endpoints(protocol: ProtocolTag) -> (Uuid, Option<Uuid>) {
    match protocol {
        ProtocolTag::FiveByte => (service_uuids::FIVE_BYTE_NOTIFY, None),
        ProtocolTag::Framed => (service_uuids::FRAMED_NOTIFY, Some(service_uuids::FRAMED_WRITE)),
        ProtocolTag::HeartRateService => (service_uuids::HEART_RATE_MEASUREMENT, None),
    }
}

/// A subscribed connection, ready for [`run_link`]
pub struct SensorLink {
    pub descriptor: DeviceDescriptor,
    pub peripheral: Peripheral,
    pub protocol: ProtocolTag,
    pub notify: Characteristic,
    pub write: Option<Characteristic>,
    notifications: BoxStream<'static, ValueNotification>,
    pub connected_at: Instant,
}

impl SensorLink {
    pub fn short_id(&self) -> &str {
        self.descriptor.short_id()
    }
}

/// The peripheral operations the notification loop needs besides the
/// notification stream itself
#[async_trait]
pub trait LinkTransport: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Write an encoded command. Fails with `NotConnected` once the
    /// peripheral is gone; other write errors are logged and absorbed.
    async fn write_command(&self, command: FramedCommand, packet: &[u8]) -> Result<()>;
}

struct PeripheralTransport {
    peripheral: Peripheral,
    write: Option<Characteristic>,
    role: DeviceRole,
    short_id: String,
}

#[async_trait]
impl LinkTransport for PeripheralTransport {
    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn write_command(&self, command: FramedCommand, packet: &[u8]) -> Result<()> {
        let Some(characteristic) = &self.write else {
            warn!("No write characteristic on {}, dropping {:?}", self.short_id, command);
            return Ok(());
        };
        debug!("⬆️ {:?} to {}: {}", command, self.short_id, hex::encode(packet));
        if let Err(e) = self
            .peripheral
            .write(characteristic, packet, WriteType::WithResponse)
            .await
        {
            if !self.is_connected().await {
                return Err(BiosensorError::NotConnected(self.role));
            }
            error!("Failed to write {:?} to {}: {}", command, self.short_id, e);
        }
        Ok(())
    }
}

/// Pump notifications through the decoder until the link drops.
///
/// Framed-protocol commands are written when the decoder's schedule falls
/// due. Inter-beat intervals are fed to `hrv` and the resulting snapshot is
/// attached to the reading that carried them.
pub async fn run_link(
    link: SensorLink,
    mut decoder: SensorDecoder,
    hrv: Arc<Mutex<HrvEngine>>,
    event_sender: mpsc::UnboundedSender<BluetoothEvent>,
) {
    let SensorLink {
        descriptor,
        peripheral,
        notify,
        write,
        notifications,
        connected_at,
        ..
    } = link;

    let notify_uuid = notify.uuid;
    let values: BoxStream<'static, Vec<u8>> = Box::pin(
        notifications
            .filter(move |notification| notification.uuid == notify_uuid)
            .map(|notification| notification.value),
    );
    let transport = PeripheralTransport {
        peripheral,
        write,
        role: descriptor.role,
        short_id: descriptor.short_id().to_string(),
    };

    let received = pump(&transport, values, &mut decoder, &hrv, &event_sender, &descriptor).await;
    info!(
        "Link to {} closed after {:?} ({} notifications)",
        descriptor.short_id(),
        connected_at.elapsed(),
        received
    );
}

/// The select loop behind [`run_link`]. Returns the number of
/// notifications received.
async fn pump<T: LinkTransport>(
    transport: &T,
    mut notifications: BoxStream<'static, Vec<u8>>,
    decoder: &mut SensorDecoder,
    hrv: &Mutex<HrvEngine>,
    event_sender: &mpsc::UnboundedSender<BluetoothEvent>,
    descriptor: &DeviceDescriptor,
) -> u64 {
    let role = descriptor.role;
    let short_id = descriptor.short_id();
    let mut received = 0u64;

    let mut liveness = time::interval_at(time::Instant::now() + LINK_CHECK_INTERVAL, LINK_CHECK_INTERVAL);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let due = decoder.next_command_due();
        let wake = due
            .map(time::Instant::from_std)
            .unwrap_or_else(|| time::Instant::now() + LINK_CHECK_INTERVAL);

        tokio::select! {
            value = notifications.next() => {
                let Some(value) = value else {
                    debug!("Notification stream from {} ended", short_id);
                    break;
                };
                received += 1;
                debug!("⬇️ {} bytes from {}: {}", value.len(), short_id, hex::encode(&value));

                match decoder.decode(&value, time::Instant::now().into_std(), Utc::now()) {
                    Decoded::Reading(mut reading) => {
                        if !reading.rr_intervals.is_empty() {
                            let mut engine = hrv.lock().await;
                            engine.ingest(&reading.rr_intervals, reading.timestamp);
                            let snapshot = engine.snapshot();
                            if !snapshot.is_empty() {
                                reading.hrv = Some(snapshot);
                            }
                        }
                        let _ = event_sender.send(BluetoothEvent::ReadingReceived {
                            role,
                            device_id: descriptor.id.clone(),
                            reading,
                        });
                    }
                    Decoded::DeviceInfo(info) => {
                        info!("ℹ️ {} identified as {:?} (SN {:?})", short_id, info.model, info.serial_number);
                        let _ = event_sender.send(BluetoothEvent::DeviceInfoReceived {
                            role,
                            device_id: descriptor.id.clone(),
                            info,
                        });
                    }
                    Decoded::Nothing => {}
                }
            }

            _ = time::sleep_until(wake), if due.is_some() => {
                if let Some((command, packet)) = decoder.take_due_command(time::Instant::now().into_std()) {
                    if let Err(e) = transport.write_command(command, &packet).await {
                        warn!("Link to {} lost while writing: {}", short_id, e);
                        break;
                    }
                }
            }

            _ = liveness.tick() => {
                if !transport.is_connected().await {
                    debug!("{} no longer connected", short_id);
                    break;
                }
            }
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FramedCodec, ScheduleTiming};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTransport {
        connected: AtomicBool,
        fail_writes: bool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl LinkTransport for FakeTransport {
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn write_command(&self, _command: FramedCommand, _packet: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Err(BiosensorError::NotConnected(DeviceRole::PulseOx));
            }
            Ok(())
        }
    }

    fn oximeter() -> DeviceDescriptor {
        DeviceDescriptor {
            id: "AA:BB:CC:DD:EE:FF".to_string(),
            name: Some("O2Ring".to_string()),
            services: BTreeSet::new(),
            rssi: Some(-60),
            role: DeviceRole::PulseOx,
        }
    }

    fn framed_decoder() -> SensorDecoder {
        SensorDecoder::framed(
            FramedCodec::default(),
            ScheduleTiming::default(),
            time::Instant::now().into_std(),
        )
    }

    /// Never yields and never ends, like a backend that misses a silent drop
    fn silent() -> BoxStream<'static, Vec<u8>> {
        Box::pin(futures::stream::pending())
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_checked_while_commands_are_due() {
        let transport = FakeTransport::default();
        let mut decoder = framed_decoder();
        let hrv = Mutex::new(HrvEngine::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let finished = time::timeout(
            Duration::from_secs(15),
            pump(&transport, silent(), &mut decoder, &hrv, &tx, &oximeter()),
        )
        .await;

        assert!(finished.is_ok());
        assert!(transport.writes.load(Ordering::SeqCst) > 0);
        assert!(decoder.next_command_due().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_ends_link() {
        let transport = FakeTransport {
            connected: AtomicBool::new(true),
            fail_writes: true,
            ..Default::default()
        };
        let mut decoder = framed_decoder();
        let hrv = Mutex::new(HrvEngine::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let finished = time::timeout(
            Duration::from_secs(5),
            pump(&transport, silent(), &mut decoder, &hrv, &tx, &oximeter()),
        )
        .await;

        assert!(finished.is_ok());
        assert_eq!(transport.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_quiet_link_keeps_running() {
        let transport = FakeTransport {
            connected: AtomicBool::new(true),
            ..Default::default()
        };
        let mut decoder = SensorDecoder::five_byte();
        let hrv = Mutex::new(HrvEngine::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let finished = time::timeout(
            Duration::from_secs(60),
            pump(&transport, silent(), &mut decoder, &hrv, &tx, &oximeter()),
        )
        .await;
        assert!(finished.is_err());
    }

    #[tokio::test]
    async fn test_readings_are_forwarded() {
        let transport = FakeTransport {
            connected: AtomicBool::new(true),
            ..Default::default()
        };
        let mut decoder = SensorDecoder::five_byte();
        let hrv = Mutex::new(HrvEngine::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frames: BoxStream<'static, Vec<u8>> = Box::pin(tokio_stream::iter(vec![
            vec![0x08, 0x40, 0x00, 72, 98],
            vec![0x01],
        ]));

        let received = pump(&transport, frames, &mut decoder, &hrv, &tx, &oximeter()).await;
        assert_eq!(received, 2);
        match rx.try_recv() {
            Ok(BluetoothEvent::ReadingReceived { role, reading, .. }) => {
                assert_eq!(role, DeviceRole::PulseOx);
                assert_eq!(reading.spo2, Some(98));
            }
            other => panic!("Expected reading, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    fn uuids(list: &[Uuid]) -> BTreeSet<Uuid> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_select_protocol_by_role() {
        let all = uuids(&[
            service_uuids::FRAMED_NOTIFY,
            service_uuids::FRAMED_WRITE,
            service_uuids::HEART_RATE_MEASUREMENT,
        ]);
        assert_eq!(select_protocol(&all, DeviceRole::PulseOx), Some(ProtocolTag::Framed));
        assert_eq!(
            select_protocol(&all, DeviceRole::HrMonitor),
            Some(ProtocolTag::HeartRateService)
        );
    }

    #[test]
    fn test_framed_requires_write_endpoint() {
        let notify_only = uuids(&[service_uuids::FRAMED_NOTIFY]);
        assert_eq!(select_protocol(&notify_only, DeviceRole::PulseOx), None);

        let five_byte = uuids(&[service_uuids::FIVE_BYTE_NOTIFY, service_uuids::FRAMED_NOTIFY]);
        assert_eq!(select_protocol(&five_byte, DeviceRole::PulseOx), Some(ProtocolTag::FiveByte));
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(endpoints(ProtocolTag::FiveByte), (service_uuids::FIVE_BYTE_NOTIFY, None));
        assert_eq!(
            endpoints(ProtocolTag::Framed).1,
            Some(service_uuids::FRAMED_WRITE)
        );
    }
}
