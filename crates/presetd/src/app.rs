//! Process-lifetime wiring.
//!
//! [`App`] owns the repositories and hands them to the orchestrator and preset services.
//! It is the surface the HTTP API and the binary talk to.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::config::DiscoveryBackend;
use crate::device::DeviceClient;
use crate::device::DeviceError;
use crate::device::FixtureDeviceClient;
use crate::device::HttpDeviceClient;
use crate::device::NowPlaying;
use crate::discovery;
use crate::discovery::DiscoveryError;
use crate::discovery::DiscoveryProvider;
use crate::presets::PresetDescriptorService;
use crate::presets::PresetError;
use crate::presets::PresetService;
use crate::presets::PresetSlot;
use crate::presets::Resolved;
use crate::store;
use crate::store::Device;
use crate::store::DeviceRepository;
use crate::store::PersistenceError;
use crate::store::Preset;
use crate::store::PresetRepository;
use crate::sync::SyncError;
use crate::sync::SyncOrchestrator;
use crate::sync::SyncPhase;
use crate::sync::SyncResult;
use crate::sync::SyncSettings;

/// Failure to assemble the application.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to open storage: {0}")]
    Storage(#[from] PersistenceError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Preset(#[from] PresetError),
}

/// Errors from direct device operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub struct App {
    devices: DeviceRepository,
    presets: PresetRepository,
    client: Arc<dyn DeviceClient>,
    orchestrator: SyncOrchestrator,
    preset_service: PresetService,
    descriptors: PresetDescriptorService,
}

impl App {
    /// Build everything the configuration asks for.
    ///
    /// The fixture discovery backend brings its matching in-memory device client, so the
    /// daemon runs without any real speakers.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let (devices, presets) = store::open(config.storage.data_dir.as_deref())?;

        let client: Arc<dyn DeviceClient> = match config.discovery.backend {
            DiscoveryBackend::Fixture => Arc::new(FixtureDeviceClient::new()),
            DiscoveryBackend::Ssdp | DiscoveryBackend::Manual => Arc::new(
                HttpDeviceClient::new(config.device.timeout).map_err(AppError::Client)?,
            ),
        };
        let discovery = discovery::from_config(&config.discovery, config.device.port, client.clone())?;
        info!(
            "Using {} discovery, {} device(s) and {} preset(s) on record",
            discovery.name(),
            devices.len(),
            presets.list().len()
        );

        let settings = SyncSettings {
            discovery_timeout: config.discovery.timeout,
            enrich_timeout: config.sync.enrich_timeout,
            concurrency: config.sync.concurrency,
        };
        Self::from_parts(
            discovery,
            client,
            devices,
            presets,
            settings,
            config.server.public_url.clone(),
        )
    }

    /// Build from already constructed components.
    pub fn from_parts(
        discovery: Arc<dyn DiscoveryProvider>,
        client: Arc<dyn DeviceClient>,
        devices: DeviceRepository,
        presets: PresetRepository,
        settings: SyncSettings,
        public_url: Url,
    ) -> Result<Self, AppError> {
        let orchestrator =
            SyncOrchestrator::new(discovery, client.clone(), devices.clone(), settings);
        let preset_service =
            PresetService::new(devices.clone(), presets.clone(), client.clone(), public_url)?;
        let descriptors = PresetDescriptorService::new(presets.clone());
        Ok(Self {
            devices,
            presets,
            client,
            orchestrator,
            preset_service,
            descriptors,
        })
    }

    pub async fn sync(&self) -> Result<SyncResult, SyncError> {
        self.orchestrator.sync().await
    }

    pub fn last_sync(&self) -> Option<Arc<SyncResult>> {
        self.orchestrator.last_result()
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.orchestrator.phase()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.list()
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.devices.get(id)
    }

    /// Forget a device and its preset assignments.
    ///
    /// Presets go first: if that fails the device is still listed and the call can be
    /// repeated, and no preset outlives its device.
    pub async fn remove_device(&self, id: &str) -> Result<Device, ControlError> {
        if self.devices.get(id).is_none() {
            return Err(ControlError::UnknownDevice(id.to_string()));
        }
        let presets = self.presets.remove_device(id).await?;
        let removed = self
            .devices
            .remove(id)
            .await?
            .ok_or_else(|| ControlError::UnknownDevice(id.to_string()))?;
        info!("Removed device {} and {} preset(s)", id, presets);
        Ok(removed)
    }

    /// What the device is playing, or `None` if the model can't say.
    pub async fn now_playing(&self, id: &str) -> Result<Option<NowPlaying>, ControlError> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| ControlError::UnknownDevice(id.to_string()))?;
        Ok(self.client.get_now_playing(&device.base_url).await?)
    }

    pub async fn assign_preset(
        &self,
        device_id: &str,
        slot: PresetSlot,
        name: &str,
        url: &str,
    ) -> Result<Preset, PresetError> {
        self.preset_service
            .assign_preset(device_id, slot, name, url)
            .await
    }

    pub async fn clear_preset(
        &self,
        device_id: &str,
        slot: PresetSlot,
    ) -> Result<Option<Preset>, PresetError> {
        self.preset_service.clear_preset(device_id, slot).await
    }

    pub fn list_presets(&self, device_id: &str) -> Result<Vec<Preset>, PresetError> {
        self.preset_service.list_presets(device_id)
    }

    pub async fn press_preset(&self, device_id: &str, slot: PresetSlot) -> Result<(), PresetError> {
        self.preset_service.press_preset(device_id, slot).await
    }

    /// Answer a device's descriptor request.
    pub fn resolve(&self, device_id: &str, slot: PresetSlot) -> Resolved {
        self.descriptors.resolve(device_id, slot)
    }

    /// Sync now and then every `interval` until the task is aborted.
    pub fn spawn_periodic_sync(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match app.sync().await {
                    Ok(_) => {}
                    Err(SyncError::InProgress) => debug!("Skipping periodic sync, one is running"),
                    Err(e) => warn!("Periodic sync failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::FixtureDiscovery;
    use crate::store::Table;

    fn fixture_app() -> App {
        let (config, _) = Config::from_toml_str(
            r#"
[server]
public_url = "http://192.0.2.1:8000"

[discovery]
backend = "fixture"
"#,
        )
        .unwrap();
        App::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_remove_device_drops_presets() {
        let app = fixture_app();
        app.sync().await.unwrap();
        let slot = PresetSlot::try_from(1u32).unwrap();
        app.assign_preset("F1X7C0DE0001", slot, "Jazz", "http://stream/jazz")
            .await
            .unwrap();

        app.remove_device("F1X7C0DE0001").await.unwrap();
        assert!(app.device("F1X7C0DE0001").is_none());
        assert_eq!(app.resolve("F1X7C0DE0001", slot), Resolved::NotAssigned);
        assert!(matches!(
            app.remove_device("F1X7C0DE0001").await,
            Err(ControlError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        let app = App::from_parts(
            Arc::new(FixtureDiscovery::new(8090)),
            Arc::new(FixtureDeviceClient::new()),
            DeviceRepository::in_memory(),
            PresetRepository::new(Table::open(&path).unwrap()),
            SyncSettings::default(),
            Url::parse("http://192.0.2.1:8000").unwrap(),
        )
        .unwrap();
        app.sync().await.unwrap();
        let slot = PresetSlot::try_from(1u32).unwrap();
        app.assign_preset("F1X7C0DE0001", slot, "Jazz", "http://stream/jazz")
            .await
            .unwrap();

        // Swap the presets file for a non-empty directory so the next save fails.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"").unwrap();

        assert!(matches!(
            app.remove_device("F1X7C0DE0001").await,
            Err(ControlError::Persistence(_))
        ));
        assert!(app.device("F1X7C0DE0001").is_some());
        assert!(matches!(
            app.resolve("F1X7C0DE0001", slot),
            Resolved::Assigned(_)
        ));
    }

    #[tokio::test]
    async fn test_now_playing_follows_button_press() {
        let app = fixture_app();
        app.sync().await.unwrap();
        let slot = PresetSlot::try_from(2u32).unwrap();

        assert!(app
            .now_playing("F1X7C0DE0003")
            .await
            .unwrap()
            .unwrap()
            .is_standby());

        app.assign_preset("F1X7C0DE0003", slot, "News", "http://stream/news")
            .await
            .unwrap();
        app.press_preset("F1X7C0DE0003", slot).await.unwrap();

        let playing = app.now_playing("F1X7C0DE0003").await.unwrap().unwrap();
        assert_eq!(playing.station_name.as_deref(), Some("News"));
        assert!(matches!(
            app.now_playing("nope").await,
            Err(ControlError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_data_dir_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[server]
public_url = "http://192.0.2.1:8000"

[discovery]
backend = "fixture"

[storage]
data_dir = "{}"
"#,
            dir.path().display()
        );
        let (config, _) = Config::from_toml_str(&toml).unwrap();

        let app = App::from_config(&config).unwrap();
        app.sync().await.unwrap();
        app.assign_preset(
            "F1X7C0DE0002",
            PresetSlot::try_from(6u32).unwrap(),
            "Talk",
            "http://stream/talk",
        )
        .await
        .unwrap();
        drop(app);

        let restarted = App::from_config(&config).unwrap();
        assert_eq!(restarted.list_devices().len(), 3);
        assert_eq!(restarted.list_presets("F1X7C0DE0002").unwrap().len(), 1);
    }
}
