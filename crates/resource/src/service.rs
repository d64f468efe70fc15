//! The card resource service: lifecycle, public API and event handling

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{CardResourceServiceConfig, RegularPluginConfig};
use crate::error::{Error, PluginError, Result};
use crate::event::{SourceEvent, SourceEventSender, source_event_channel};
use crate::monitor::ServiceMonitor;
use crate::plugin::{PoolPlugin, Reader};
use crate::profile_manager::CardProfileManager;
use crate::reader_manager::ReaderManager;
use crate::resource::CardResource;

/// Service allocating exclusive card resources to clients.
///
/// Each instance is independent. Share it with `Arc` between the threads
/// allocating resources and the code delivering plugin events.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use nexum_card_resource::{AtrProfileExtension, CardProfile, CardResourceService,
/// #     CardResourceServiceConfig, Plugin, Reader};
/// # fn plugin() -> Arc<dyn Plugin> { unimplemented!() }
/// # fn main() -> Result<(), nexum_card_resource::Error> {
/// let config = CardResourceServiceConfig::builder()
///     .add_plugin(plugin(), |_: &dyn Reader| {})
///     .add_profile(CardProfile::new("transit", AtrProfileExtension::new(vec![0x3B, 0x8F])))
///     .build()?;
///
/// let service = CardResourceService::new();
/// service.configure(config)?;
/// service.start()?;
///
/// if let Some(resource) = service.get_card_resource("transit")? {
///     // exchange APDUs through resource.reader()
///     service.release_card_resource(&resource)?;
/// }
/// service.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct CardResourceService {
    /// Held for writing for the whole duration of configure/start/stop
    lifecycle: RwLock<Lifecycle>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    config: Option<Arc<CardResourceServiceConfig>>,
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    state: Arc<ServiceState>,
    monitor: ServiceMonitor,
}

impl CardResourceService {
    /// Create an unconfigured, stopped service
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a configuration, restarting the service if it is running
    pub fn configure(&self, config: CardResourceServiceConfig) -> Result<()> {
        info!("Applying a new configuration...");
        let mut lifecycle = self.lifecycle.write();
        let config = Arc::new(config);
        if lifecycle.running.is_some() {
            Self::stop_locked(&mut lifecycle);
            lifecycle.config = Some(config);
            Self::start_locked(&mut lifecycle)?;
        } else {
            lifecycle.config = Some(config);
        }
        info!("New configuration applied");
        Ok(())
    }

    /// Start the service, restarting it if already running
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        if lifecycle.config.is_none() {
            return Err(Error::NotConfigured);
        }
        if lifecycle.running.is_some() {
            Self::stop_locked(&mut lifecycle);
        }
        Self::start_locked(&mut lifecycle)
    }

    /// Stop the service; no-op when not running
    pub fn stop(&self) {
        Self::stop_locked(&mut self.lifecycle.write());
    }

    /// Whether the service is running
    pub fn is_started(&self) -> bool {
        self.lifecycle.read().running.is_some()
    }

    fn start_locked(lifecycle: &mut Lifecycle) -> Result<()> {
        let config = Arc::clone(lifecycle.config.as_ref().ok_or(Error::NotConfigured)?);
        info!("Starting...");

        let (events, receiver) = source_event_channel();
        let state = Arc::new(ServiceState::new(config, events));
        if let Err(error) = state.initialize() {
            state.clear();
            return Err(error.into());
        }
        state.start_monitoring();
        let monitor = ServiceMonitor::spawn(Arc::clone(&state), receiver);

        lifecycle.running = Some(Running { state, monitor });
        info!("Started");
        Ok(())
    }

    fn stop_locked(lifecycle: &mut Lifecycle) {
        let Some(running) = lifecycle.running.take() else {
            return;
        };
        running.state.stop_monitoring();
        running.monitor.shutdown();
        running.state.clear();
        info!("Stopped");
    }

    fn state(&self) -> Result<Arc<ServiceState>> {
        self.lifecycle
            .read()
            .running
            .as_ref()
            .map(|running| Arc::clone(&running.state))
            .ok_or(Error::NotStarted)
    }

    /// Allocate a resource matching the named profile.
    ///
    /// `Ok(None)` means no resource is available right now (or, in blocking
    /// mode, none became available before the timeout).
    #[instrument(skip(self), level = "debug")]
    pub fn get_card_resource(&self, profile: &str) -> Result<Option<CardResource>> {
        let state = self.state()?;
        let manager = state
            .profile_manager(profile)
            .ok_or_else(|| Error::UnknownProfile(profile.to_string()))?;

        let resource = manager.allocate(&state);
        match &resource {
            Some(resource) => debug!(%resource, "Card resource allocated"),
            None => debug!("No card resource available"),
        }
        Ok(resource)
    }

    /// Release a resource obtained from [`Self::get_card_resource`].
    ///
    /// Releasing twice, or releasing a resource whose reader is gone, is a no-op.
    #[instrument(skip_all, fields(resource = resource.id()), level = "debug")]
    pub fn release_card_resource(&self, resource: &CardResource) -> Result<()> {
        self.state()?.release_card_resource(resource);
        Ok(())
    }

    /// Release a resource and forget it for good, e.g. because it proved unusable
    #[instrument(skip_all, fields(resource = resource.id()), level = "debug")]
    pub fn remove_card_resource(&self, resource: &CardResource) -> Result<()> {
        self.state()?.remove_card_resource(resource);
        Ok(())
    }

    /// Channel accepting events from plugins and readers, while running
    pub fn event_sender(&self) -> Option<SourceEventSender> {
        self.lifecycle
            .read()
            .running
            .as_ref()
            .map(|running| running.state.events.clone())
    }

    /// Process an event on the calling thread; ignored while stopped
    pub fn notify(&self, event: SourceEvent) {
        match self.state() {
            Ok(state) => state.dispatch(event),
            Err(_) => debug!(?event, "Service not started, event ignored"),
        }
    }
}

/// State of a running service, shared with the event coordinator
pub(crate) struct ServiceState {
    config: Arc<CardResourceServiceConfig>,
    running: AtomicBool,
    events: SourceEventSender,
    reader_managers: RwLock<HashMap<String, Arc<ReaderManager>>>,
    profile_managers: RwLock<HashMap<String, Arc<CardProfileManager>>>,
    pool_resources: RwLock<HashMap<CardResource, Arc<dyn PoolPlugin>>>,
    /// Serializes the events of each reader
    event_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceState {
    fn new(config: Arc<CardResourceServiceConfig>, events: SourceEventSender) -> Self {
        Self {
            config,
            running: AtomicBool::new(true),
            events,
            reader_managers: RwLock::default(),
            profile_managers: RwLock::default(),
            pool_resources: RwLock::default(),
            event_locks: Mutex::default(),
        }
    }

    pub(crate) fn config(&self) -> &CardResourceServiceConfig {
        &self.config
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn reader_manager(&self, reader: &str) -> Option<Arc<ReaderManager>> {
        self.reader_managers.read().get(reader).cloned()
    }

    pub(crate) fn profile_manager(&self, profile: &str) -> Option<Arc<CardProfileManager>> {
        self.profile_managers.read().get(profile).cloned()
    }

    fn profile_managers(&self) -> Vec<Arc<CardProfileManager>> {
        self.profile_managers.read().values().cloned().collect()
    }

    fn initialize(&self) -> Result<(), PluginError> {
        for plugin_config in self.config.regular_plugins() {
            for reader in plugin_config.plugin().readers()? {
                self.get_or_register_reader(reader, plugin_config);
            }
        }

        for profile in self.config.profiles() {
            let manager = CardProfileManager::new(profile.clone(), self)?;
            self.profile_managers
                .write()
                .insert(profile.name().to_string(), Arc::new(manager));
        }

        let inactive: Vec<String> = self
            .reader_managers
            .read()
            .values()
            .filter(|manager| !manager.is_active())
            .map(|manager| manager.reader_name().to_string())
            .collect();
        for reader in inactive {
            debug!(reader, "Reader not used by any profile");
            self.reader_managers.write().remove(&reader);
        }
        Ok(())
    }

    /// Register a reader, running its plugin's reader configurator once.
    ///
    /// Returns the manager and whether it was created by this call.
    fn get_or_register_reader(
        &self,
        reader: Arc<dyn Reader>,
        plugin_config: &RegularPluginConfig,
    ) -> (Arc<ReaderManager>, bool) {
        if let Some(manager) = self.reader_manager(reader.name()) {
            return (manager, false);
        }

        plugin_config.reader_configurator().setup_reader(reader.as_ref());
        let manager = Arc::new(ReaderManager::new(
            reader,
            plugin_config.plugin().name(),
            self.config.usage_timeout(),
        ));
        debug!(
            reader = manager.reader_name(),
            plugin = manager.plugin_name(),
            "Reader registered"
        );
        self.reader_managers
            .write()
            .insert(manager.reader_name().to_string(), Arc::clone(&manager));
        (manager, true)
    }

    fn unregister_reader(&self, manager: &ReaderManager) {
        self.stop_card_detection(manager);
        self.reader_managers.write().remove(manager.reader_name());
        debug!(reader = manager.reader_name(), "Reader unregistered");
    }

    pub(crate) fn register_pool_resource(&self, resource: CardResource, pool: Arc<dyn PoolPlugin>) {
        debug!(%resource, pool = pool.name(), "Pool card resource registered");
        self.pool_resources.write().insert(resource, pool);
    }

    pub(crate) fn release_card_resource(&self, resource: &CardResource) {
        let pool = self.pool_resources.write().remove(resource);
        if let Some(pool) = pool {
            if let Err(error) = pool.release_reader(resource.reader()) {
                warn!(%resource, pool = pool.name(), %error, "Failed to release pool reader");
            }
            debug!(%resource, "Pool card resource released");
            return;
        }

        match self.reader_manager(resource.reader_name()) {
            Some(manager) => {
                manager.lock().unlock(resource);
                debug!(%resource, "Card resource released");
            }
            None => debug!(%resource, "Card resource unknown or no longer referenced"),
        }
    }

    pub(crate) fn remove_card_resource(&self, resource: &CardResource) {
        self.release_card_resource(resource);

        match self.reader_manager(resource.reader_name()) {
            Some(manager) => {
                let mut guard = manager.lock();
                guard.remove_resource(resource);
                self.purge_from_profiles(resource);
            }
            None => self.purge_from_profiles(resource),
        }
        debug!(%resource, "Card resource removed");
    }

    fn purge_from_profiles(&self, resource: &CardResource) {
        for profile in self.profile_managers() {
            profile.remove_resource(resource);
        }
    }

    /// Evict every resource known for a reader
    fn remove_reader_resources(&self, manager: &ReaderManager) {
        let resources = manager.lock().resources();
        for resource in &resources {
            self.remove_card_resource(resource);
        }
    }

    fn start_monitoring(&self) {
        for plugin_config in self.config.regular_plugins() {
            let plugin = plugin_config.plugin();
            if let Some(handler) = plugin_config.plugin_monitoring() {
                match plugin.as_observable() {
                    Some(observable) => {
                        if let Err(error) = observable.add_observer(self.events.clone()) {
                            handler.on_plugin_observation_error(plugin.name(), &error);
                        }
                    }
                    None => warn!(plugin = plugin.name(), "Plugin is not observable"),
                }
            }
        }

        let managers: Vec<_> = self.reader_managers.read().values().cloned().collect();
        for manager in managers {
            self.start_card_detection(&manager);
        }
    }

    fn stop_monitoring(&self) {
        self.running.store(false, Ordering::Release);
        for plugin_config in self.config.regular_plugins() {
            if plugin_config.plugin_monitoring().is_some() {
                if let Some(observable) = plugin_config.plugin().as_observable() {
                    observable.remove_observers();
                }
            }
        }

        let managers: Vec<_> = self.reader_managers.read().values().cloned().collect();
        for manager in managers {
            self.stop_card_detection(&manager);
        }
    }

    fn start_card_detection(&self, manager: &ReaderManager) {
        let Some(plugin_config) = self.config.regular_plugin(manager.plugin_name()) else {
            return;
        };
        let Some(handler) = plugin_config.reader_monitoring() else {
            return;
        };
        if let Some(observable) = manager.reader().as_observable() {
            if let Err(error) =
                observable.start_card_detection(plugin_config.detection_mode(), self.events.clone())
            {
                handler.on_reader_observation_error(
                    manager.plugin_name(),
                    manager.reader_name(),
                    &error,
                );
            }
        }
    }

    fn stop_card_detection(&self, manager: &ReaderManager) {
        let monitored = self
            .config
            .regular_plugin(manager.plugin_name())
            .is_some_and(|config| config.reader_monitoring().is_some());
        if monitored {
            if let Some(observable) = manager.reader().as_observable() {
                observable.stop_card_detection();
            }
        }
    }

    fn clear(&self) {
        self.running.store(false, Ordering::Release);
        self.reader_managers.write().clear();
        self.profile_managers.write().clear();
        self.pool_resources.write().clear();
        self.event_locks.lock().clear();
    }

    fn event_lock(&self, reader: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.event_locks
                .lock()
                .entry(reader.to_string())
                .or_default(),
        )
    }

    /// Handle an event, routing failures to the configured exception handlers
    pub(crate) fn dispatch(&self, event: SourceEvent) {
        if !self.is_running() {
            return;
        }

        let (plugin, reader) = self.event_origin(&event);
        if let SourceEvent::ObservationFailed { error, .. } = &event {
            self.report_observation_error(plugin.as_deref(), reader.as_deref(), error);
            return;
        }

        if let Err(error) = self.handle_event(event) {
            self.report_observation_error(plugin.as_deref(), reader.as_deref(), &error);
        }
    }

    fn event_origin(&self, event: &SourceEvent) -> (Option<String>, Option<String>) {
        match event {
            SourceEvent::ReaderConnected { plugin, reader }
            | SourceEvent::ReaderDisconnected { plugin, reader } => {
                (Some(plugin.clone()), Some(reader.clone()))
            }
            SourceEvent::ObservationFailed { plugin, reader, .. } => {
                (Some(plugin.clone()), reader.clone())
            }
            other => {
                let reader = other.reader_name().map(str::to_string);
                let plugin = reader
                    .as_deref()
                    .and_then(|reader| self.reader_manager(reader))
                    .map(|manager| manager.plugin_name().to_string());
                (plugin, reader)
            }
        }
    }

    fn report_observation_error(
        &self,
        plugin: Option<&str>,
        reader: Option<&str>,
        error: &PluginError,
    ) {
        let plugin_config = plugin.and_then(|plugin| self.config.regular_plugin(plugin));
        match (plugin_config, reader) {
            (Some(config), Some(reader)) if config.reader_monitoring().is_some() => {
                if let Some(handler) = config.reader_monitoring() {
                    handler.on_reader_observation_error(config.plugin().name(), reader, error);
                }
            }
            (Some(config), _) if config.plugin_monitoring().is_some() => {
                if let Some(handler) = config.plugin_monitoring() {
                    handler.on_plugin_observation_error(config.plugin().name(), error);
                }
            }
            _ => error!(?plugin, ?reader, %error, "Unhandled observation error"),
        }
    }

    fn handle_event(&self, event: SourceEvent) -> Result<(), PluginError> {
        let Some(reader) = event.reader_name() else {
            return Ok(());
        };
        let connecting = matches!(event, SourceEvent::ReaderConnected { .. });
        if !connecting && self.reader_manager(reader).is_none() {
            trace!(reader, "Event for an unregistered reader ignored");
            return Ok(());
        }
        let lock = self.event_lock(reader);
        let _serialized = lock.lock();

        let result = match &event {
            SourceEvent::ReaderConnected { plugin, reader } => {
                self.on_reader_connected(plugin, reader)
            }
            SourceEvent::ReaderDisconnected { reader, .. } => {
                if let Some(manager) = self.reader_manager(reader) {
                    debug!(
                        reader = manager.reader_name(),
                        "Remove disconnected reader and all associated card resources"
                    );
                    self.remove_reader_resources(&manager);
                    self.unregister_reader(&manager);
                }
                Ok(())
            }
            SourceEvent::CardInserted { reader } | SourceEvent::CardMatched { reader } => {
                if let Some(manager) = self.reader_manager(reader) {
                    for profile in self.profile_managers() {
                        profile.on_card_inserted(&manager);
                    }
                }
                Ok(())
            }
            SourceEvent::CardRemoved { reader } | SourceEvent::ReaderUnregistered { reader } => {
                if let Some(manager) = self.reader_manager(reader) {
                    debug!(
                        reader = manager.reader_name(),
                        "Remove all card resources associated with reader"
                    );
                    self.remove_reader_resources(&manager);
                }
                Ok(())
            }
            SourceEvent::ObservationFailed { .. } => Ok(()),
        };

        if self.reader_manager(reader).is_none() {
            self.event_locks.lock().remove(reader);
        }
        result
    }

    fn on_reader_connected(&self, plugin: &str, reader: &str) -> Result<(), PluginError> {
        let Some(plugin_config) = self.config.regular_plugin(plugin) else {
            warn!(plugin, reader, "Reader connected to an unconfigured plugin");
            return Ok(());
        };
        let reader = plugin_config
            .plugin()
            .reader(reader)
            .ok_or_else(|| PluginError::ReaderNotFound(reader.to_string()))?;

        let (manager, created) = self.get_or_register_reader(reader, plugin_config);
        for profile in self.profile_managers() {
            profile.on_reader_connected(&manager);
        }

        if !manager.is_active() {
            self.unregister_reader(&manager);
        } else if created {
            self.start_card_detection(&manager);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceState")
            .field("running", &self.is_running())
            .field("readers", &self.reader_managers.read().len())
            .field("profiles", &self.profile_managers.read().len())
            .field("pool_resources", &self.pool_resources.read().len())
            .finish_non_exhaustive()
    }
}
