use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use futures_util::stream;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::result::FailureKind;
use super::result::SyncFailure;
use super::result::SyncResult;
use crate::capabilities;
use crate::device::DeviceClient;
use crate::discovery::DiscoveredDevice;
use crate::discovery::DiscoveryError;
use crate::discovery::DiscoveryProvider;
use crate::store::Device;
use crate::store::DeviceRepository;
use crate::store::UpsertOutcome;

/// Extra time a discovery backend gets past its own timeout before the run gives up on it.
const DISCOVERY_GRACE: Duration = Duration::from_secs(1);

/// Where the current run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Discovering,
    Enriching,
    Persisting,
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No devices could even be searched for
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(#[source] DiscoveryError),

    #[error("a sync is already in progress")]
    InProgress,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Passed to the discovery backend
    pub discovery_timeout: Duration,

    /// Bound on each device's info request
    pub enrich_timeout: Duration,

    /// Devices enriched at once
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(5),
            enrich_timeout: Duration::from_secs(5),
            concurrency: 8,
        }
    }
}

/// Runs discover → enrich → persist.
///
/// At most one run is active at a time; a second caller gets [`SyncError::InProgress`]
/// straight away instead of waiting. One device failing never stops the others.
pub struct SyncOrchestrator {
    discovery: Arc<dyn DiscoveryProvider>,
    client: Arc<dyn DeviceClient>,
    devices: DeviceRepository,
    settings: SyncSettings,

    /// Held for the whole of a run
    running: Mutex<()>,

    phase: watch::Sender<SyncPhase>,
    last_result: ArcSwapOption<SyncResult>,
}

/// Puts the phase back to `Idle` if a run ends without reaching `Done`.
struct PhaseGuard<'a>(&'a watch::Sender<SyncPhase>);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|phase| {
            if *phase == SyncPhase::Done {
                false
            } else {
                *phase = SyncPhase::Idle;
                true
            }
        });
    }
}

impl SyncOrchestrator {
    pub fn new(
        discovery: Arc<dyn DiscoveryProvider>,
        client: Arc<dyn DeviceClient>,
        devices: DeviceRepository,
        settings: SyncSettings,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            discovery,
            client,
            devices,
            settings,
            running: Mutex::new(()),
            phase,
            last_result: ArcSwapOption::empty(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Result of the most recent completed run.
    pub fn last_result(&self) -> Option<Arc<SyncResult>> {
        self.last_result.load_full()
    }

    /// Run one sync.
    ///
    /// Only a discovery outage fails the run. Per-device problems are reported in the
    /// result. Dropping the future part way leaves every stored record either fully
    /// written or untouched.
    pub async fn sync(&self) -> Result<SyncResult, SyncError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Rejecting sync: one is already running");
            return Err(SyncError::InProgress);
        };
        let _phase = PhaseGuard(&self.phase);
        let started_at = Utc::now();

        self.phase.send_replace(SyncPhase::Discovering);
        let discovered = self.discover().await.map_err(|e| {
            warn!("Sync aborted, {} discovery failed: {}", self.discovery.name(), e);
            SyncError::DiscoveryUnavailable(e)
        })?;
        let discovered_count = discovered.len();

        self.phase.send_replace(SyncPhase::Enriching);
        let enriched: Vec<Result<Device, SyncFailure>> = stream::iter(discovered)
            .map(|found| self.enrich(found))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        let mut by_id: BTreeMap<String, Device> = BTreeMap::new();
        for outcome in enriched {
            match outcome {
                Ok(device) => match by_id.entry(device.id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(device);
                    }
                    Entry::Occupied(mut slot) => {
                        debug!("{} answered at {} and {}", device.id, slot.get().ip, device.ip);
                        if device.last_seen >= slot.get().last_seen {
                            slot.insert(device);
                        }
                    }
                },
                Err(failure) => failures.push(failure),
            }
        }

        self.phase.send_replace(SyncPhase::Persisting);
        let mut synced = 0;
        for device in by_id.into_values() {
            let (id, address) = (device.id.clone(), device.ip);
            match self.devices.upsert(device).await {
                Ok(UpsertOutcome::Stale) => {
                    debug!("Kept newer stored record for {}", id);
                    synced += 1;
                }
                Ok(_) => synced += 1,
                Err(e) => {
                    error!("Failed to save device {}: {}", id, e);
                    failures.push(SyncFailure {
                        address,
                        device_id: Some(id),
                        kind: FailureKind::Persistence,
                        error: e.to_string(),
                    });
                }
            }
        }

        let result = SyncResult::new(discovered_count, synced, failures, started_at);
        info!(
            "Sync finished: {} discovered, {} synced, {} failed",
            result.discovered(),
            result.synced(),
            result.failed()
        );
        self.last_result.store(Some(Arc::new(result.clone())));
        self.phase.send_replace(SyncPhase::Done);
        Ok(result)
    }

    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let timeout = self.settings.discovery_timeout;
        let found = tokio::time::timeout(timeout + DISCOVERY_GRACE, self.discovery.discover(timeout))
            .await
            .map_err(|_| DiscoveryError::TimedOut(timeout + DISCOVERY_GRACE))??;

        let mut addresses = HashSet::new();
        let unique: Vec<DiscoveredDevice> = found
            .into_iter()
            .filter(|d| addresses.insert(d.address))
            .collect();
        debug!(
            "{} discovery returned {} device(s)",
            self.discovery.name(),
            unique.len()
        );
        Ok(unique)
    }

    async fn enrich(&self, found: DiscoveredDevice) -> Result<Device, SyncFailure> {
        let failure = |kind, error: String| {
            warn!("Could not sync device at {}: {}", found.address, error);
            SyncFailure {
                address: found.address,
                device_id: None,
                kind,
                error,
            }
        };

        let timeout = self.settings.enrich_timeout;
        let info = match tokio::time::timeout(timeout, self.client.get_info(&found.base_url)).await
        {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return Err(failure(FailureKind::from(&e), e.to_string())),
            Err(_) => {
                return Err(failure(
                    FailureKind::Timeout,
                    format!("no answer within {:?}", timeout),
                ))
            }
        };

        let model = if info.model.is_empty() {
            found.model.clone().unwrap_or_default()
        } else {
            info.model
        };
        let name = if info.name.is_empty() {
            found.name.clone().unwrap_or_default()
        } else {
            info.name
        };
        let capabilities = capabilities::detect(&model, info.firmware_version.as_deref());
        debug!("Enriched {} ({}) at {}", info.id, model, found.address);

        let seen = Utc::now();
        Ok(Device {
            id: info.id,
            ip: found.address,
            base_url: found.base_url,
            name,
            model,
            firmware_version: info.firmware_version,
            capabilities,
            last_seen: seen,
            created_at: seen,
            updated_at: seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::capabilities::Capability;
    use crate::device::host_ip;
    use crate::device::DeviceError;
    use crate::device::DeviceInfo;
    use crate::device::DevicePreset;
    use crate::device::FixtureDeviceClient;
    use crate::device::NowPlaying;
    use crate::presets::PresetSlot;
    use crate::store::Table;
    use crate::discovery::FixtureDiscovery;

    fn orchestrator(
        discovery: Arc<dyn DiscoveryProvider>,
        client: FixtureDeviceClient,
    ) -> (SyncOrchestrator, DeviceRepository) {
        let devices = DeviceRepository::in_memory();
        let orchestrator = SyncOrchestrator::new(
            discovery,
            Arc::new(client),
            devices.clone(),
            SyncSettings {
                discovery_timeout: Duration::from_millis(50),
                enrich_timeout: Duration::from_secs(1),
                concurrency: 2,
            },
        );
        (orchestrator, devices)
    }

    fn fixture() -> Arc<dyn DiscoveryProvider> {
        Arc::new(FixtureDiscovery::new(8090))
    }

    /// Returns a fixed list, possibly with repeats.
    struct StaticDiscovery(Vec<DiscoveredDevice>);

    #[async_trait]
    impl DiscoveryProvider for StaticDiscovery {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn discover(&self, _: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDiscovery;

    #[async_trait]
    impl DiscoveryProvider for BrokenDiscovery {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn discover(&self, _: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
            Err(DiscoveryError::Send(std::io::Error::other("network is down")))
        }
    }

    /// Blocks until released, so a run can be held in the discovering phase.
    struct GatedDiscovery(Arc<Notify>);

    #[async_trait]
    impl DiscoveryProvider for GatedDiscovery {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn discover(&self, _: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
            self.0.notified().await;
            Ok(Vec::new())
        }
    }

    /// Fixture speakers, except one that never answers in time and one that answers junk.
    struct MisbehavingClient {
        inner: FixtureDeviceClient,
        slow: IpAddr,
        garbled: IpAddr,
    }

    #[async_trait]
    impl DeviceClient for MisbehavingClient {
        async fn get_info(&self, base_url: &str) -> Result<DeviceInfo, DeviceError> {
            let address = host_ip(base_url);
            if address == Some(self.slow) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if address == Some(self.garbled) {
                return Err(DeviceError::Protocol {
                    url: base_url.to_string(),
                    reason: "expected <info>, found <html>".to_string(),
                });
            }
            self.inner.get_info(base_url).await
        }

        async fn get_now_playing(
            &self,
            base_url: &str,
        ) -> Result<Option<NowPlaying>, DeviceError> {
            self.inner.get_now_playing(base_url).await
        }

        async fn list_presets(&self, base_url: &str) -> Result<Vec<DevicePreset>, DeviceError> {
            self.inner.list_presets(base_url).await
        }

        async fn store_preset(
            &self,
            base_url: &str,
            slot: PresetSlot,
            display_name: &str,
            descriptor_url: &str,
        ) -> Result<(), DeviceError> {
            self.inner
                .store_preset(base_url, slot, display_name, descriptor_url)
                .await
        }

        async fn simulate_button(
            &self,
            base_url: &str,
            slot: PresetSlot,
        ) -> Result<(), DeviceError> {
            self.inner.simulate_button(base_url, slot).await
        }
    }

    #[tokio::test]
    async fn test_sync_persists_fixture_devices() {
        let (orchestrator, devices) = orchestrator(fixture(), FixtureDeviceClient::new());

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.discovered(), 3);
        assert_eq!(result.synced(), 3);
        assert_eq!(result.failed(), 0);
        assert_eq!(devices.len(), 3);

        let living_room = devices.get("F1X7C0DE0002").unwrap();
        assert_eq!(living_room.model, "SoundTouch 300");
        assert!(living_room.capabilities.contains(Capability::HdmiInput));

        assert_eq!(orchestrator.phase(), SyncPhase::Done);
        assert_eq!(orchestrator.last_result().as_deref(), Some(&result));
    }

    #[tokio::test]
    async fn test_second_sync_is_idempotent() {
        let (orchestrator, devices) = orchestrator(fixture(), FixtureDeviceClient::new());

        orchestrator.sync().await.unwrap();
        let first = devices.list();
        orchestrator.sync().await.unwrap();
        let second = devices.list();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.created_at, b.created_at);
            assert!(b.updated_at > a.updated_at);
        }
    }

    #[tokio::test]
    async fn test_one_unreachable_device_does_not_abort_run() {
        let unreachable: IpAddr = "192.0.2.12".parse().unwrap();
        let (orchestrator, devices) = orchestrator(
            fixture(),
            FixtureDeviceClient::new().with_unreachable(unreachable),
        );

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.discovered(), 3);
        assert_eq!(result.synced(), 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.failures()[0].address, unreachable);
        assert_eq!(result.failures()[0].kind, FailureKind::Unreachable);
        assert!(devices.get("F1X7C0DE0002").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_discoveries_collapse() {
        let mut twice = FixtureDiscovery::new(8090)
            .discover(Duration::ZERO)
            .await
            .unwrap();
        twice.extend(twice.clone());
        let (orchestrator, devices) = orchestrator(
            Arc::new(StaticDiscovery(twice)),
            FixtureDeviceClient::new(),
        );

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.discovered(), 3);
        assert_eq!(result.synced(), 3);
        assert_eq!(devices.len(), 3);
    }

    #[tokio::test]
    async fn test_no_devices_is_not_an_error() {
        let (orchestrator, devices) = orchestrator(
            Arc::new(StaticDiscovery(Vec::new())),
            FixtureDeviceClient::new(),
        );

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.discovered(), 0);
        assert_eq!(result.synced(), 0);
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_failure_fails_run() {
        let (orchestrator, devices) =
            orchestrator(Arc::new(BrokenDiscovery), FixtureDeviceClient::new());

        let err = orchestrator.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::DiscoveryUnavailable(_)));
        assert_eq!(orchestrator.phase(), SyncPhase::Idle);
        assert!(orchestrator.last_result().is_none());
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let gate = Arc::new(Notify::new());
        let (orchestrator, _) = orchestrator(
            Arc::new(GatedDiscovery(gate.clone())),
            FixtureDeviceClient::new(),
        );
        let orchestrator = Arc::new(orchestrator);

        let mut phase = orchestrator.subscribe();
        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.sync().await }
        });
        phase
            .wait_for(|p| *p == SyncPhase::Discovering)
            .await
            .unwrap();

        assert!(matches!(
            orchestrator.sync().await,
            Err(SyncError::InProgress)
        ));

        gate.notify_one();
        let result = first.await.unwrap().unwrap();
        assert_eq!(result.discovered(), 0);

        // The guard is released once the first run is done.
        gate.notify_one();
        assert!(orchestrator.sync().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_sync_resets_phase() {
        let gate = Arc::new(Notify::new());
        let (orchestrator, _) = orchestrator(
            Arc::new(GatedDiscovery(gate)),
            FixtureDeviceClient::new(),
        );

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), orchestrator.sync()).await;
        assert!(cancelled.is_err());
        assert_eq!(orchestrator.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_slow_and_garbled_devices_are_recorded() {
        let slow: IpAddr = "192.0.2.11".parse().unwrap();
        let garbled: IpAddr = "192.0.2.13".parse().unwrap();
        let devices = DeviceRepository::in_memory();
        let orchestrator = SyncOrchestrator::new(
            fixture(),
            Arc::new(MisbehavingClient {
                inner: FixtureDeviceClient::new(),
                slow,
                garbled,
            }),
            devices.clone(),
            SyncSettings {
                discovery_timeout: Duration::from_millis(50),
                enrich_timeout: Duration::from_millis(100),
                concurrency: 3,
            },
        );

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.discovered(), 3);
        assert_eq!(result.synced(), 1);
        assert_eq!(result.failed(), 2);

        let kind_for = |address: IpAddr| {
            result
                .failures()
                .iter()
                .find(|f| f.address == address)
                .map(|f| f.kind)
        };
        assert_eq!(kind_for(slow), Some(FailureKind::Timeout));
        assert_eq!(kind_for(garbled), Some(FailureKind::Protocol));
        assert!(devices.get("F1X7C0DE0002").is_some());
    }

    #[tokio::test]
    async fn test_save_failures_are_recorded_and_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let devices = DeviceRepository::new(Table::open(&path).unwrap());

        // A non-empty directory where the file should go makes every save fail.
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"").unwrap();

        let orchestrator = SyncOrchestrator::new(
            fixture(),
            Arc::new(FixtureDeviceClient::new()),
            devices.clone(),
            SyncSettings::default(),
        );

        let result = orchestrator.sync().await.unwrap();
        assert_eq!(result.discovered(), 3);
        assert_eq!(result.synced(), 0);
        assert_eq!(result.failed(), 3);
        assert!(result
            .failures()
            .iter()
            .all(|f| f.kind == FailureKind::Persistence && f.device_id.is_some()));
        assert!(devices.is_empty());
        assert_eq!(orchestrator.phase(), SyncPhase::Done);
    }

    #[tokio::test]
    async fn test_hung_discovery_times_out() {
        let (orchestrator, _) = orchestrator(
            Arc::new(GatedDiscovery(Arc::new(Notify::new()))),
            FixtureDeviceClient::new(),
        );

        let started = std::time::Instant::now();
        let err = orchestrator.sync().await.unwrap_err();
        assert!(
            matches!(
                err,
                SyncError::DiscoveryUnavailable(DiscoveryError::TimedOut(_))
            ),
            "{:?}",
            err
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(orchestrator.phase(), SyncPhase::Idle);
    }
}
