//! Per-profile candidate list and allocation search

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::config::{AllocationMode, AllocationStrategy};
use crate::error::{LockError, PluginError};
use crate::plugin::{ConfiguredPlugin, Plugin, PoolPlugin};
use crate::profile::CardProfile;
use crate::reader_manager::ReaderManager;
use crate::resource::CardResource;
use crate::service::ServiceState;

/// Ordered list of known-good resources, replaced as a whole on every change
#[derive(Debug, Default)]
struct Candidates {
    version: u64,
    list: Arc<Vec<CardResource>>,
}

impl Candidates {
    fn replace(&mut self, list: Vec<CardResource>) {
        self.list = Arc::new(list);
        self.version += 1;
    }
}

/// Manager of one card resource profile
pub(crate) struct CardProfileManager {
    profile: CardProfile,
    /// Regular plugins in scope, by name
    regular_plugins: Vec<String>,
    /// Pool plugins in scope
    pool_plugins: Vec<Arc<dyn PoolPlugin>>,
    candidates: RwLock<Candidates>,
}

impl CardProfileManager {
    /// Resolve the plugin scope and collect the resources already available
    pub(crate) fn new(profile: CardProfile, state: &ServiceState) -> Result<Self, PluginError> {
        let config = state.config();
        let scope: Vec<ConfiguredPlugin> = if profile.plugins().is_empty() {
            config
                .regular_plugins()
                .iter()
                .map(|regular| ConfiguredPlugin::Regular(Arc::clone(regular.plugin())))
                .chain(
                    config
                        .pool_plugins()
                        .iter()
                        .map(|pool| ConfiguredPlugin::Pool(Arc::clone(pool))),
                )
                .collect()
        } else {
            profile
                .plugins()
                .iter()
                .filter_map(|name| config.plugin(name))
                .collect()
        };

        let mut regular = Vec::new();
        let mut pool_plugins = Vec::new();
        for plugin in scope {
            match plugin {
                ConfiguredPlugin::Regular(plugin) => regular.push(plugin),
                ConfiguredPlugin::Pool(plugin) => pool_plugins.push(plugin),
            }
        }

        let manager = Self {
            regular_plugins: regular.iter().map(|plugin| plugin.name().to_string()).collect(),
            profile,
            pool_plugins,
            candidates: RwLock::default(),
        };

        for plugin in &regular {
            manager.initialize_plugin(plugin.as_ref(), state)?;
        }

        debug!(
            profile = manager.name(),
            candidates = manager.candidates.read().list.len(),
            regular = manager.regular_plugins.len(),
            pool = manager.pool_plugins.len(),
            "Card resource profile initialized"
        );
        Ok(manager)
    }

    pub(crate) fn name(&self) -> &str {
        self.profile.name()
    }

    fn initialize_plugin(&self, plugin: &dyn Plugin, state: &ServiceState) -> Result<(), PluginError> {
        for reader in plugin.readers()? {
            if let Some(manager) = state.reader_manager(reader.name()) {
                self.initialize_reader(&manager);
            }
        }
        Ok(())
    }

    fn initialize_reader(&self, reader_manager: &ReaderManager) {
        if !self.profile.accepts_reader(reader_manager.reader_name()) {
            trace!(
                profile = self.name(),
                reader = reader_manager.reader_name(),
                "Reader rejected by name filter"
            );
            return;
        }

        reader_manager.activate();

        let mut guard = reader_manager.lock();
        if let Some(resource) = guard.try_match_and_register(self.profile.extension()) {
            self.add_candidate(resource);
        }
    }

    fn add_candidate(&self, resource: CardResource) {
        let mut candidates = self.candidates.write();
        if candidates.list.contains(&resource) {
            debug!(%resource, profile = self.name(), "Card resource already present in profile");
            return;
        }
        let mut list = candidates.list.to_vec();
        list.push(resource.clone());
        candidates.replace(list);
        debug!(%resource, profile = self.name(), "Card resource added to profile");
    }

    /// Drop a resource from the candidates, if present
    pub(crate) fn remove_resource(&self, resource: &CardResource) {
        let mut candidates = self.candidates.write();
        if !candidates.list.contains(resource) {
            return;
        }
        let list = candidates
            .list
            .iter()
            .filter(|candidate| *candidate != resource)
            .cloned()
            .collect();
        candidates.replace(list);
        debug!(%resource, profile = self.name(), "Card resource removed from profile");
    }

    /// Evaluate a newly connected reader
    pub(crate) fn on_reader_connected(&self, reader_manager: &ReaderManager) {
        if !self.profile.plugins().is_empty()
            && !self
                .regular_plugins
                .iter()
                .any(|plugin| plugin == reader_manager.plugin_name())
        {
            return;
        }
        self.initialize_reader(reader_manager);
    }

    /// Evaluate a card newly inserted into a known reader
    pub(crate) fn on_card_inserted(&self, reader_manager: &ReaderManager) {
        self.on_reader_connected(reader_manager);
    }

    /// Current candidates, in scan order
    pub(crate) fn candidates(&self) -> Arc<Vec<CardResource>> {
        Arc::clone(&self.candidates.read().list)
    }

    /// Search for a usable resource, retrying in blocking mode
    pub(crate) fn allocate(&self, state: &ServiceState) -> Option<CardResource> {
        let mode = state.config().mode();
        let deadline = match mode {
            AllocationMode::Blocking { timeout, .. } => Some(Instant::now() + timeout),
            AllocationMode::NonBlocking => None,
        };

        loop {
            if let Some(resource) = self.search(state) {
                return Some(resource);
            }

            let (AllocationMode::Blocking { cycle, .. }, Some(deadline)) = (mode, deadline) else {
                return None;
            };
            let now = Instant::now();
            if now >= deadline || !state.is_running() {
                debug!(profile = self.name(), "Allocation timed out");
                return None;
            }
            thread::sleep(cycle.min(deadline - now));
        }
    }

    fn search(&self, state: &ServiceState) -> Option<CardResource> {
        let has_regular = !self.regular_plugins.is_empty();
        let has_pool = !self.pool_plugins.is_empty();

        match (has_regular, has_pool) {
            (true, true) if state.config().pool_first() => self
                .search_pool(state)
                .or_else(|| self.search_regular(state)),
            (true, true) => self
                .search_regular(state)
                .or_else(|| self.search_pool(state)),
            (true, false) => self.search_regular(state),
            (false, true) => self.search_pool(state),
            (false, false) => None,
        }
    }

    fn search_regular(&self, state: &ServiceState) -> Option<CardResource> {
        let snapshot = self.candidates();
        let extension = self.profile.extension();
        let mut unusable = Vec::new();
        let mut found = None;

        for candidate in snapshot.iter() {
            let Some(reader_manager) = state.reader_manager(candidate.reader_name()) else {
                unusable.push(candidate.clone());
                continue;
            };

            let mut guard = reader_manager.lock();
            match guard.try_lock(candidate, extension) {
                Ok(Some(leased)) => {
                    found = Some(leased);
                    break;
                }
                Ok(None) => trace!(%candidate, "Card resource busy"),
                Err(LockError::Unusable) => {
                    debug!(%candidate, "Card resource no longer usable");
                    unusable.push(candidate.clone());
                }
                Err(LockError::CardChanged) => {
                    warn!(%candidate, "Card changed in reader, evicting card resource");
                    unusable.push(candidate.clone());
                }
            }
        }

        if let Some(resource) = &found {
            self.apply_strategy(resource, state.config().strategy());
        }

        for resource in &unusable {
            state.remove_card_resource(resource);
        }

        found
    }

    fn apply_strategy(&self, allocated: &CardResource, strategy: AllocationStrategy) {
        let mut candidates = self.candidates.write();
        let Some(index) = candidates.list.iter().position(|c| c == allocated) else {
            return;
        };
        if let Some(list) = reorder(&candidates.list, index, strategy) {
            candidates.replace(list);
        }
    }

    fn search_pool(&self, state: &ServiceState) -> Option<CardResource> {
        let group_reference = self.profile.reader_group_reference();

        for pool in &self.pool_plugins {
            let reader = match pool.allocate_reader(group_reference) {
                Ok(Some(reader)) => reader,
                Ok(None) => {
                    trace!(pool = pool.name(), "Pool plugin has no reader available");
                    continue;
                }
                Err(error) => {
                    debug!(pool = pool.name(), %error, "Pool reader allocation failed");
                    continue;
                }
            };

            match self.profile.extension().matches(reader.as_ref()) {
                Some(card) => {
                    let resource = CardResource::new(reader, card);
                    state.register_pool_resource(resource.clone(), Arc::clone(pool));
                    return Some(resource);
                }
                None => {
                    debug!(
                        pool = pool.name(),
                        reader = reader.name(),
                        profile = self.name(),
                        "Pool reader card does not match profile"
                    );
                    if let Err(error) = pool.release_reader(&reader) {
                        warn!(pool = pool.name(), %error, "Failed to release pool reader");
                    }
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for CardProfileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardProfileManager")
            .field("profile", &self.profile)
            .field("regular_plugins", &self.regular_plugins)
            .field("pool_plugins", &self.pool_plugins.len())
            .field("version", &self.candidates.read().version)
            .finish()
    }
}

/// New scan order after a successful allocation at `index`, or `None` to keep
/// the current one.
fn reorder(
    list: &[CardResource],
    index: usize,
    strategy: AllocationStrategy,
) -> Option<Vec<CardResource>> {
    match strategy {
        AllocationStrategy::First => None,
        AllocationStrategy::Cyclic => {
            let mut list = list.to_vec();
            let len = list.len();
            list.rotate_left((index + 1) % len);
            Some(list)
        }
        AllocationStrategy::Random => {
            let mut list = list.to_vec();
            list.shuffle(&mut rand::rng());
            Some(list)
        }
    }
}
