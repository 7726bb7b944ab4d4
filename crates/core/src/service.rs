//! Biosensor service - the caller-facing surface
//!
//! Owns the radio lifecycle, the session supervisor and the active links,
//! and delivers events to registered callbacks from a single dispatch task.

use crate::bluetooth::events::{BluetoothEvent, ConnectionState, EventHandlers};
use crate::bluetooth::lifecycle::{RadioFactory, RadioLifecycle};
use crate::bluetooth::manager::{self, RadioManager};
use crate::bluetooth::supervisor::{DisconnectCause, DisconnectOutcome, SessionSupervisor};
use crate::config::Config;
use crate::device::{Advertisement, DeviceClassifier, DeviceDescriptor, DeviceRole};
use crate::error::{BiosensorError, Result};
use crate::hrv::{HrvEngine, HrvSnapshot};
use crate::protocol::{DeviceInfo, ProtocolTag, Reading, SensorDecoder};
use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Which links `disconnect` tears down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectTarget {
    Role(DeviceRole),
    All,
}

struct ActiveLink {
    descriptor: DeviceDescriptor,
    peripheral: Peripheral,
    protocol: ProtocolTag,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ScanState {
    task: Option<JoinHandle<()>>,
    target: Option<DeviceRole>,
    /// Devices already surfaced since scanning started
    reported: HashSet<String>,
}

impl ScanState {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

struct ServiceInner {
    config: Config,
    classifier: DeviceClassifier,
    lifecycle: RadioLifecycle<RadioManager>,
    supervisor: SessionSupervisor,
    handlers: Arc<StdRwLock<EventHandlers>>,
    event_sender: mpsc::UnboundedSender<BluetoothEvent>,
    scan: Mutex<ScanState>,
    discovered: RwLock<HashMap<String, DeviceDescriptor>>,
    links: Mutex<HashMap<DeviceRole, ActiveLink>>,
    hrv: Mutex<HashMap<DeviceRole, Arc<Mutex<HrvEngine>>>>,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(task) = self.scan.get_mut().task.take() {
            task.abort();
        }
        for (_, link) in self.links.get_mut().drain() {
            link.task.abort();
        }
        if let Some(task) = self
            .dispatch_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        debug!("BiosensorService dropped");
    }
}

/// Handle to the biosensor core. Clones share the same radio and sessions.
#[derive(Clone)]
pub struct BiosensorService {
    inner: Arc<ServiceInner>,
}

impl BiosensorService {
    /// Create the service. Must be called from within a Tokio runtime.
    /// The radio itself is created on the first `acquire_reference`.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let factory: RadioFactory<RadioManager> =
            Arc::new(|| -> BoxFuture<'static, Result<RadioManager>> { Box::pin(RadioManager::new()) });

        let inner = Arc::new(ServiceInner {
            classifier: DeviceClassifier::default(),
            lifecycle: RadioLifecycle::new(factory, config.teardown_debounce()),
            supervisor: SessionSupervisor::new(config.recovery_window(), event_sender.clone()),
            handlers: Arc::new(StdRwLock::new(EventHandlers::default())),
            event_sender,
            scan: Mutex::new(ScanState::default()),
            discovered: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            hrv: Mutex::new(HashMap::new()),
            dispatch_task: StdMutex::new(None),
            config,
        });

        let task = Self::spawn_dispatcher(Arc::downgrade(&inner), event_receiver);
        *inner
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ========================================================================
    // Callback registration
    // ========================================================================

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, EventHandlers> {
        self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_device_found(&self, handler: impl Fn(&DeviceDescriptor) + Send + Sync + 'static) {
        self.handlers_mut().on_device_found(handler);
    }

    pub fn on_reading(&self, handler: impl Fn(DeviceRole, &Reading) + Send + Sync + 'static) {
        self.handlers_mut().on_reading(handler);
    }

    pub fn on_device_info(&self, handler: impl Fn(DeviceRole, &DeviceInfo) + Send + Sync + 'static) {
        self.handlers_mut().on_device_info(handler);
    }

    pub fn on_connection_status(&self, handler: impl Fn(DeviceRole, bool) + Send + Sync + 'static) {
        self.handlers_mut().on_connection_status(handler);
    }

    pub fn on_session_terminated(&self, handler: impl Fn(DeviceRole) + Send + Sync + 'static) {
        self.handlers_mut().on_session_terminated(handler);
    }

    fn spawn_dispatcher(
        weak: Weak<ServiceInner>,
        mut receiver: mpsc::UnboundedReceiver<BluetoothEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = BiosensorService { inner };

                if let BluetoothEvent::SessionTerminated { .. } = &event {
                    service.reset_unconnected_protocol_state().await;
                }

                let handlers = Arc::clone(&service.inner.handlers);
                drop(service);
                handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dispatch(&event);
            }
            debug!("Event dispatcher stopped");
        })
    }

    // ========================================================================
    // Radio
    // ========================================================================

    /// Platform permission prompt. Desktop stacks grant access when the
    /// manager is created; `false` means the OS refused.
    pub async fn request_permissions(&self) -> Result<bool> {
        RadioManager::request_access().await
    }

    pub async fn is_radio_enabled(&self) -> Result<bool> {
        RadioManager::is_radio_enabled().await
    }

    /// Take a radio reference, creating the radio on first use
    pub async fn acquire_reference(&self) -> Result<()> {
        self.inner.lifecycle.acquire().await.map(|_| ())
    }

    /// Release a radio reference; teardown is debounced
    pub async fn release_reference(&self) {
        self.inner.lifecycle.release().await;
    }

    async fn radio(&self) -> Result<Arc<RadioManager>> {
        self.inner
            .lifecycle
            .current()
            .await
            .ok_or(BiosensorError::RadioNotAcquired)
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    /// Start (or retarget) discovery for `role`
    pub async fn start_scan(&self, role: DeviceRole) -> Result<()> {
        if role == DeviceRole::Unknown {
            return Err(BiosensorError::ScanFailed(
                "scan target must be a known role".to_string(),
            ));
        }
        let radio = self.radio().await?;
        self.inner.supervisor.want(role).await;

        let mut scan = self.inner.scan.lock().await;
        scan.target = Some(role);
        if scan.is_running() {
            info!("🔍 Scan target changed to {}", role);
        } else {
            radio.start_scan().await?;
            scan.task = Some(self.spawn_scan_task());
            info!("🔍 Scanning for {}", role);
        }
        drop(scan);

        self.emit(BluetoothEvent::ScanningStateChanged {
            scanning: true,
            target: Some(role),
        });
        Ok(())
    }

    /// Stop discovery and forget every unconnected descriptor
    pub async fn stop_scan(&self) {
        let mut scan = self.inner.scan.lock().await;
        let was_running = scan.is_running();
        if let Some(task) = scan.task.take() {
            task.abort();
        }
        scan.target = None;
        scan.reported.clear();
        drop(scan);

        self.inner.discovered.write().await.clear();

        if was_running {
            if let Some(radio) = self.inner.lifecycle.current().await {
                radio.stop_scan().await;
            }
            info!("Stopped BLE scanning");
            self.emit(BluetoothEvent::ScanningStateChanged {
                scanning: false,
                target: None,
            });
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.scan.lock().await.is_running()
    }

    pub async fn scan_target(&self) -> Option<DeviceRole> {
        self.inner.scan.lock().await.target
    }

    fn spawn_scan_task(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.scan_interval();

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                interval.tick().await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = BiosensorService { inner };
                let Some(radio) = service.inner.lifecycle.current().await else {
                    debug!("Radio released, scan loop exiting");
                    break;
                };

                match radio.advertisements().await {
                    Ok(advertisements) => {
                        for advertisement in &advertisements {
                            service.process_advertisement(advertisement).await;
                        }
                    }
                    Err(e) => error!("Error getting peripherals: {}", e),
                }
            }
        })
    }

    /// Classify one advertisement against the current scan target and
    /// surface it once if it matches
    pub(crate) async fn process_advertisement(&self, ad: &Advertisement) -> Option<DeviceDescriptor> {
        if let (Some(min), Some(rssi)) = (self.inner.config.min_rssi, ad.rssi) {
            if rssi < min {
                return None;
            }
        }

        let mut scan = self.inner.scan.lock().await;
        let target = scan.target?;
        if scan.reported.contains(&ad.id) {
            return None;
        }
        if self
            .inner
            .links
            .lock()
            .await
            .values()
            .any(|link| link.descriptor.id == ad.id)
        {
            return None;
        }
        let descriptor = self.inner.classifier.describe_if(ad, target)?;
        scan.reported.insert(ad.id.clone());
        drop(scan);

        info!(
            "📱 Found {} {} ({}) rssi {:?}",
            descriptor.role,
            descriptor.display_name(),
            descriptor.short_id(),
            descriptor.rssi
        );
        self.inner
            .discovered
            .write()
            .await
            .insert(descriptor.id.clone(), descriptor.clone());
        self.emit(BluetoothEvent::DeviceFound(descriptor.clone()));
        Some(descriptor)
    }

    pub async fn discovered_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.discovered.read().await.values().cloned().collect()
    }

    /// Follow the scan policy after a connection change
    async fn apply_scan_policy(&self, next: Option<DeviceRole>) {
        match next {
            Some(role) => {
                if let Err(e) = self.start_scan(role).await {
                    warn!("Could not resume scanning for {}: {}", role, e);
                }
            }
            None => self.stop_scan().await,
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to a discovered device and start streaming readings
    pub async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        let radio = self.radio().await?;
        let role = descriptor.role;

        if let Some(existing) = self.inner.links.lock().await.get(&role) {
            if existing.descriptor.id == descriptor.id {
                return Ok(());
            }
            return Err(BiosensorError::connection(
                &descriptor.id,
                format!("{} already connected to {}", role, existing.descriptor.short_id()),
            ));
        }

        self.inner.supervisor.begin_connecting(role, &descriptor.id).await;
        let link = match radio.open_link(descriptor, self.inner.config.connection_timeout()).await {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to connect to {}: {}", descriptor.short_id(), e);
                self.inner.supervisor.connection_failed(role).await;
                return Err(e);
            }
        };

        let decoder = match link.protocol {
            ProtocolTag::FiveByte => SensorDecoder::five_byte(),
            ProtocolTag::HeartRateService => SensorDecoder::heart_rate(),
            ProtocolTag::Framed => SensorDecoder::framed(
                self.inner.config.framed_codec(),
                self.inner.config.schedule_timing(),
                time::Instant::now().into_std(),
            ),
        };
        let hrv = self.hrv_engine(role).await;
        let peripheral = link.peripheral.clone();
        let protocol = link.protocol;

        let mut links = self.inner.links.lock().await;
        let next = self.inner.supervisor.mark_connected(role, &descriptor.id).await;

        let weak = Arc::downgrade(&self.inner);
        let event_sender = self.inner.event_sender.clone();
        let lost = descriptor.clone();
        let task = tokio::spawn(async move {
            manager::run_link(link, decoder, hrv, event_sender).await;
            if let Some(inner) = weak.upgrade() {
                BiosensorService { inner }.link_lost(lost).await;
            }
        });

        links.insert(
            role,
            ActiveLink {
                descriptor: descriptor.clone(),
                peripheral,
                protocol,
                task,
            },
        );
        drop(links);

        self.inner.discovered.write().await.remove(&descriptor.id);
        self.apply_scan_policy(next).await;
        Ok(())
    }

    /// Tear down links on request. No recovery is attempted.
    pub async fn disconnect(&self, target: DisconnectTarget) -> Result<()> {
        let roles = match target {
            DisconnectTarget::Role(role) => vec![role],
            DisconnectTarget::All => vec![DeviceRole::PulseOx, DeviceRole::HrMonitor],
        };

        for role in roles {
            let link = self.inner.links.lock().await.remove(&role);
            if let Some(link) = link {
                link.task.abort();
                if let Err(e) = link.peripheral.disconnect().await {
                    warn!("Error disconnecting {}: {}", link.descriptor.short_id(), e);
                }
                info!("Disconnected {} ({})", link.descriptor.display_name(), link.protocol);
            }
            self.inner
                .supervisor
                .handle_disconnect(role, DisconnectCause::Requested)
                .await;
            self.inner.supervisor.unwant(role).await;
            self.reset_protocol_state(role).await;
        }
        Ok(())
    }

    /// Runs on the link task once its notification stream ends
    async fn link_lost(&self, descriptor: DeviceDescriptor) {
        let role = descriptor.role;
        {
            let mut links = self.inner.links.lock().await;
            if links.get(&role).is_some_and(|link| link.descriptor.id == descriptor.id) {
                links.remove(&role);
            }
        }
        warn!("🔌 Lost link to {} ({})", descriptor.display_name(), role);

        match self
            .inner
            .supervisor
            .handle_disconnect(role, DisconnectCause::Unexpected)
            .await
        {
            DisconnectOutcome::Recovering => self.spawn_reconnect(descriptor),
            DisconnectOutcome::Disconnected => {
                let next = self.inner.supervisor.scan_target().await;
                self.apply_scan_policy(next).await;
            }
        }
    }

    /// Retry the lost device until it reconnects or the grace period ends
    fn spawn_reconnect(&self, descriptor: DeviceDescriptor) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.reconnect_interval();

        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                time::sleep(interval).await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let service = BiosensorService { inner };
                if service.connection_state(descriptor.role).await != ConnectionState::Recovering {
                    return;
                }

                attempt += 1;
                info!("🔁 Reconnect attempt {} to {}", attempt, descriptor.short_id());
                match service.connect(&descriptor).await {
                    Ok(()) => return,
                    Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
                }
            }
        });
    }

    pub async fn connection_state(&self, role: DeviceRole) -> ConnectionState {
        self.inner.supervisor.state(role).await
    }

    pub async fn connected_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .links
            .lock()
            .await
            .values()
            .map(|link| link.descriptor.clone())
            .collect()
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Arm the recovery grace period for unexpected disconnects
    pub async fn begin_session(&self) {
        self.inner.supervisor.begin_session().await;
    }

    pub async fn end_session(&self) {
        self.inner.supervisor.end_session().await;
    }

    pub async fn is_session_active(&self) -> bool {
        self.inner.supervisor.is_session_active().await
    }

    // ========================================================================
    // HRV
    // ========================================================================

    async fn hrv_engine(&self, role: DeviceRole) -> Arc<Mutex<HrvEngine>> {
        let config = &self.inner.config;
        let mut engines = self.inner.hrv.lock().await;
        Arc::clone(engines.entry(role).or_insert_with(|| {
            Arc::new(Mutex::new(HrvEngine::new(
                config.quick_timeframe(),
                config.real_timeframe(),
            )))
        }))
    }

    pub async fn hrv_snapshot(&self, role: DeviceRole) -> Option<HrvSnapshot> {
        let engine = self.inner.hrv.lock().await.get(&role).cloned()?;
        let snapshot = engine.lock().await.snapshot();
        Some(snapshot)
    }

    /// Clear the sliding windows kept for `role`
    async fn reset_protocol_state(&self, role: DeviceRole) {
        let engine = self.inner.hrv.lock().await.get(&role).cloned();
        if let Some(engine) = engine {
            engine.lock().await.reset();
            debug!("HRV windows cleared for {}", role);
        }
    }

    /// Clear HRV history for every role without a live link
    async fn reset_unconnected_protocol_state(&self) {
        let roles: Vec<DeviceRole> = self.inner.hrv.lock().await.keys().copied().collect();
        for role in roles {
            if self.connection_state(role).await != ConnectionState::Connected {
                self.reset_protocol_state(role).await;
            }
        }
    }

    /// Stop scanning, drop every link and end the session
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down biosensor service");
        self.stop_scan().await;
        self.end_session().await;
        self.disconnect(DisconnectTarget::All).await?;
        info!("Biosensor service shutdown complete");
        Ok(())
    }

    fn emit(&self, event: BluetoothEvent) {
        if self.inner.event_sender.send(event).is_err() {
            debug!("Event channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::service_uuids;
    use std::time::Duration;

    async fn service() -> BiosensorService {
        BiosensorService::new(Config::default()).await.unwrap()
    }

    async fn target(service: &BiosensorService, role: DeviceRole) {
        service.inner.scan.lock().await.target = Some(role);
    }

    #[tokio::test]
    async fn test_only_target_role_is_surfaced_once() {
        let service = service().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        service.on_device_found(move |descriptor| {
            let _ = tx.send(descriptor.id.clone());
        });
        target(&service, DeviceRole::PulseOx).await;

        let oximeter = Advertisement::new("ox-1").with_service(service_uuids::FIVE_BYTE_SERVICE);
        let strap = Advertisement::new("hr-1").with_local_name("Polar H10 12345");

        assert!(service.process_advertisement(&oximeter).await.is_some());
        assert!(service.process_advertisement(&oximeter).await.is_none());
        assert!(service.process_advertisement(&strap).await.is_none());

        assert_eq!(rx.recv().await.as_deref(), Some("ox-1"));
        assert_eq!(service.discovered_devices().await.len(), 1);

        target(&service, DeviceRole::HrMonitor).await;
        let found = service.process_advertisement(&strap).await.unwrap();
        assert_eq!(found.role, DeviceRole::HrMonitor);
    }

    #[tokio::test]
    async fn test_no_target_surfaces_nothing() {
        let service = service().await;
        let oximeter = Advertisement::new("ox-1").with_service(service_uuids::FRAMED_SERVICE);
        assert!(service.process_advertisement(&oximeter).await.is_none());
    }

    #[tokio::test]
    async fn test_min_rssi_filter() {
        let config = Config::default().with_min_rssi(-70);
        let service = BiosensorService::new(config).await.unwrap();
        target(&service, DeviceRole::PulseOx).await;

        let weak = Advertisement::new("ox-1")
            .with_service(service_uuids::FIVE_BYTE_SERVICE)
            .with_rssi(-90);
        let strong = Advertisement::new("ox-2")
            .with_service(service_uuids::FIVE_BYTE_SERVICE)
            .with_rssi(-50);
        assert!(service.process_advertisement(&weak).await.is_none());
        assert!(service.process_advertisement(&strong).await.is_some());
    }

    #[tokio::test]
    async fn test_stop_scan_discards_descriptors() {
        let service = service().await;
        target(&service, DeviceRole::PulseOx).await;
        let oximeter = Advertisement::new("ox-1").with_service(service_uuids::FIVE_BYTE_SERVICE);
        service.process_advertisement(&oximeter).await;

        service.stop_scan().await;
        assert!(service.discovered_devices().await.is_empty());
        assert_eq!(service.scan_target().await, None);
    }

    #[tokio::test]
    async fn test_operations_require_radio_reference() {
        let service = service().await;
        let descriptor = DeviceDescriptor::from_advertisement(
            &Advertisement::new("ox-1").with_service(service_uuids::FIVE_BYTE_SERVICE),
            DeviceRole::PulseOx,
        );

        assert!(matches!(
            service.connect(&descriptor).await,
            Err(BiosensorError::RadioNotAcquired)
        ));
        assert!(matches!(
            service.start_scan(DeviceRole::PulseOx).await,
            Err(BiosensorError::RadioNotAcquired)
        ));
        assert!(service.start_scan(DeviceRole::Unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_session_termination_clears_hrv() {
        let service = service().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        service.on_session_terminated(move |role| {
            let _ = tx.send(role);
        });

        let engine = service.hrv_engine(DeviceRole::HrMonitor).await;
        engine
            .lock()
            .await
            .ingest(&[800.0, 810.0, 790.0], chrono::Utc::now());
        assert_eq!(engine.lock().await.interval_counts(), (3, 3));
        let abandoned = service.hrv_engine(DeviceRole::PulseOx).await;
        abandoned.lock().await.ingest(&[900.0, 910.0], chrono::Utc::now());

        service.emit(BluetoothEvent::SessionTerminated {
            role: DeviceRole::HrMonitor,
        });
        let role = time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(role, Some(DeviceRole::HrMonitor));
        assert_eq!(engine.lock().await.interval_counts(), (0, 0));
        assert_eq!(abandoned.lock().await.interval_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_requested_disconnect_without_link() {
        let service = service().await;
        service.begin_session().await;
        service
            .disconnect(DisconnectTarget::Role(DeviceRole::PulseOx))
            .await
            .unwrap();
        assert_eq!(
            service.connection_state(DeviceRole::PulseOx).await,
            ConnectionState::Disconnected
        );
        assert!(service.is_session_active().await);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = Config {
            poll_interval_ms: 0,
            ..Default::default()
        };
        let result = runtime.block_on(BiosensorService::new(config));
        assert!(matches!(result, Err(BiosensorError::InvalidConfig(_))));
    }
}
