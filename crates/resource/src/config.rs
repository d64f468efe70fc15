//! Configuration of the card resource service

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::plugin::{
    ConfiguredPlugin, DetectionMode, Plugin, PluginObservationExceptionHandler, PoolPlugin,
    ReaderConfigurator, ReaderObservationExceptionHandler,
};
use crate::profile::CardProfile;

/// Default usage timeout applied by [`CardResourceServiceConfigBuilder::with_default_usage_timeout`]
pub const DEFAULT_USAGE_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default poll cycle of the blocking allocation mode
pub const DEFAULT_CYCLE_DURATION: Duration = Duration::from_millis(100);
/// Default timeout of the blocking allocation mode
pub const DEFAULT_ALLOCATION_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Order in which the candidates of a profile are tried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Always try candidates from the first one
    #[default]
    First,
    /// Start after the last allocated candidate
    Cyclic,
    /// Shuffle candidates after each allocation
    Random,
}

/// Behaviour of an allocation request when no resource is available
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocationMode {
    /// Return immediately
    #[default]
    NonBlocking,
    /// Retry every `cycle` until `timeout` elapses
    Blocking {
        /// Pause between two attempts
        cycle: Duration,
        /// Overall time limit
        timeout: Duration,
    },
}

/// Allocation tuning that can be loaded from a settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationSettings {
    /// Candidate ordering strategy
    pub strategy: AllocationStrategy,
    /// Search pool plugins before regular plugins
    pub pool_first: bool,
    /// Maximum time a resource may stay locked, in milliseconds
    pub usage_timeout_ms: Option<u64>,
    /// Blocking allocation mode; absent means non-blocking
    pub blocking: Option<BlockingSettings>,
}

/// Blocking allocation mode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingSettings {
    /// Pause between two attempts, in milliseconds
    pub cycle_ms: u64,
    /// Overall time limit, in milliseconds
    pub timeout_ms: u64,
}

/// A regular plugin with its reader setup and monitoring options
#[derive(Clone)]
pub struct RegularPluginConfig {
    plugin: Arc<dyn Plugin>,
    reader_configurator: Arc<dyn ReaderConfigurator>,
    plugin_monitoring: Option<Arc<dyn PluginObservationExceptionHandler>>,
    reader_monitoring: Option<Arc<dyn ReaderObservationExceptionHandler>>,
    detection_mode: DetectionMode,
}

impl RegularPluginConfig {
    /// Create a plugin configuration without monitoring
    pub fn new<C>(plugin: Arc<dyn Plugin>, reader_configurator: C) -> Self
    where
        C: ReaderConfigurator + 'static,
    {
        Self {
            plugin,
            reader_configurator: Arc::new(reader_configurator),
            plugin_monitoring: None,
            reader_monitoring: None,
            detection_mode: DetectionMode::default(),
        }
    }

    /// Observe reader connections, reporting observation errors to `handler`
    pub fn with_plugin_monitoring<H>(mut self, handler: H) -> Self
    where
        H: PluginObservationExceptionHandler + 'static,
    {
        self.plugin_monitoring = Some(Arc::new(handler));
        self
    }

    /// Observe card insertions, reporting observation errors to `handler`
    pub fn with_reader_monitoring<H>(mut self, handler: H) -> Self
    where
        H: ReaderObservationExceptionHandler + 'static,
    {
        self.reader_monitoring = Some(Arc::new(handler));
        self
    }

    /// Set the card detection mode used with reader monitoring
    pub const fn with_detection_mode(mut self, mode: DetectionMode) -> Self {
        self.detection_mode = mode;
        self
    }

    /// The plugin
    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub(crate) fn reader_configurator(&self) -> &dyn ReaderConfigurator {
        self.reader_configurator.as_ref()
    }

    pub(crate) fn plugin_monitoring(&self) -> Option<&dyn PluginObservationExceptionHandler> {
        self.plugin_monitoring.as_deref()
    }

    pub(crate) fn reader_monitoring(&self) -> Option<&dyn ReaderObservationExceptionHandler> {
        self.reader_monitoring.as_deref()
    }

    pub(crate) const fn detection_mode(&self) -> DetectionMode {
        self.detection_mode
    }
}

impl fmt::Debug for RegularPluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegularPluginConfig")
            .field("plugin", &self.plugin.name())
            .field("plugin_monitoring", &self.plugin_monitoring.is_some())
            .field("reader_monitoring", &self.reader_monitoring.is_some())
            .field("detection_mode", &self.detection_mode)
            .finish()
    }
}

/// Validated configuration of the card resource service
#[derive(Debug, Clone)]
pub struct CardResourceServiceConfig {
    regular_plugins: Vec<RegularPluginConfig>,
    pool_plugins: Vec<Arc<dyn PoolPlugin>>,
    strategy: AllocationStrategy,
    mode: AllocationMode,
    usage_timeout: Option<Duration>,
    pool_first: bool,
    profiles: Vec<CardProfile>,
}

impl CardResourceServiceConfig {
    /// Start building a configuration
    pub fn builder() -> CardResourceServiceConfigBuilder {
        CardResourceServiceConfigBuilder::default()
    }

    /// Configured regular plugins, in order
    pub fn regular_plugins(&self) -> &[RegularPluginConfig] {
        &self.regular_plugins
    }

    /// Configured pool plugins, in order
    pub fn pool_plugins(&self) -> &[Arc<dyn PoolPlugin>] {
        &self.pool_plugins
    }

    /// Candidate ordering strategy
    pub const fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Allocation mode
    pub const fn mode(&self) -> AllocationMode {
        self.mode
    }

    /// Maximum time a resource may stay locked
    pub const fn usage_timeout(&self) -> Option<Duration> {
        self.usage_timeout
    }

    /// Whether pool plugins are searched before regular plugins
    pub const fn pool_first(&self) -> bool {
        self.pool_first
    }

    /// Configured profiles
    pub fn profiles(&self) -> &[CardProfile] {
        &self.profiles
    }

    /// Look up a configured plugin by name
    pub fn plugin(&self, name: &str) -> Option<ConfiguredPlugin> {
        self.regular_plugins
            .iter()
            .find(|config| config.plugin.name() == name)
            .map(|config| ConfiguredPlugin::Regular(Arc::clone(&config.plugin)))
            .or_else(|| {
                self.pool_plugins
                    .iter()
                    .find(|plugin| plugin.name() == name)
                    .map(|plugin| ConfiguredPlugin::Pool(Arc::clone(plugin)))
            })
    }

    pub(crate) fn regular_plugin(&self, name: &str) -> Option<&RegularPluginConfig> {
        self.regular_plugins
            .iter()
            .find(|config| config.plugin.name() == name)
    }
}

/// Builder for [`CardResourceServiceConfig`]
#[derive(Debug, Default)]
pub struct CardResourceServiceConfigBuilder {
    regular_plugins: Vec<RegularPluginConfig>,
    pool_plugins: Vec<Arc<dyn PoolPlugin>>,
    strategy: AllocationStrategy,
    mode: AllocationMode,
    usage_timeout: Option<Duration>,
    pool_first: bool,
    profiles: Vec<CardProfile>,
}

impl CardResourceServiceConfigBuilder {
    /// Add a regular plugin without monitoring
    pub fn add_plugin<C>(self, plugin: Arc<dyn Plugin>, reader_configurator: C) -> Self
    where
        C: ReaderConfigurator + 'static,
    {
        self.add_plugin_with_config(RegularPluginConfig::new(plugin, reader_configurator))
    }

    /// Add a regular plugin with explicit monitoring options
    pub fn add_plugin_with_config(mut self, config: RegularPluginConfig) -> Self {
        self.regular_plugins.push(config);
        self
    }

    /// Add a pool plugin
    pub fn add_pool_plugin(mut self, plugin: Arc<dyn PoolPlugin>) -> Self {
        self.pool_plugins.push(plugin);
        self
    }

    /// Set the candidate ordering strategy
    pub const fn with_allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Limit the time a resource may stay locked
    pub const fn with_usage_timeout(mut self, timeout: Duration) -> Self {
        self.usage_timeout = Some(timeout);
        self
    }

    /// Limit the time a resource may stay locked to [`DEFAULT_USAGE_TIMEOUT`]
    pub const fn with_default_usage_timeout(self) -> Self {
        self.with_usage_timeout(DEFAULT_USAGE_TIMEOUT)
    }

    /// Search pool plugins before regular plugins
    pub const fn with_pool_first(mut self, pool_first: bool) -> Self {
        self.pool_first = pool_first;
        self
    }

    /// Retry allocations every `cycle` until `timeout` elapses
    pub const fn with_blocking_allocation_mode(mut self, cycle: Duration, timeout: Duration) -> Self {
        self.mode = AllocationMode::Blocking { cycle, timeout };
        self
    }

    /// Blocking allocation with [`DEFAULT_CYCLE_DURATION`] and [`DEFAULT_ALLOCATION_TIMEOUT`]
    pub const fn with_default_blocking_allocation_mode(self) -> Self {
        self.with_blocking_allocation_mode(DEFAULT_CYCLE_DURATION, DEFAULT_ALLOCATION_TIMEOUT)
    }

    /// Return immediately when no resource is available
    pub const fn with_non_blocking_allocation_mode(mut self) -> Self {
        self.mode = AllocationMode::NonBlocking;
        self
    }

    /// Apply settings loaded from a file
    pub fn with_settings(mut self, settings: &AllocationSettings) -> Self {
        self.strategy = settings.strategy;
        self.pool_first = settings.pool_first;
        self.usage_timeout = settings.usage_timeout_ms.map(Duration::from_millis);
        self.mode = settings
            .blocking
            .map_or(AllocationMode::NonBlocking, |blocking| AllocationMode::Blocking {
                cycle: Duration::from_millis(blocking.cycle_ms),
                timeout: Duration::from_millis(blocking.timeout_ms),
            });
        self
    }

    /// Add a card resource profile
    pub fn add_profile(mut self, profile: CardProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<CardResourceServiceConfig, ConfigError> {
        if self.regular_plugins.is_empty() && self.pool_plugins.is_empty() {
            return Err(ConfigError::NoPlugin);
        }
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfile);
        }

        let mut plugin_names = HashSet::new();
        let names = self
            .regular_plugins
            .iter()
            .map(|config| config.plugin.name())
            .chain(self.pool_plugins.iter().map(|plugin| plugin.name()));
        for name in names {
            if name.is_empty() {
                return Err(ConfigError::EmptyName("plugin name"));
            }
            if !plugin_names.insert(name) {
                return Err(ConfigError::DuplicatePlugin(name.to_string()));
            }
        }

        if let AllocationMode::Blocking { cycle, timeout } = self.mode {
            if cycle.is_zero() {
                return Err(ConfigError::InvalidParameter("cycle duration must be positive"));
            }
            if timeout.is_zero() {
                return Err(ConfigError::InvalidParameter("timeout must be positive"));
            }
        }
        if self.usage_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::InvalidParameter("usage timeout must be positive"));
        }

        let mut profile_names = HashSet::new();
        let mut profiles = Vec::with_capacity(self.profiles.len());
        for mut profile in self.profiles {
            if profile.name().is_empty() {
                return Err(ConfigError::EmptyName("profile name"));
            }
            if !profile_names.insert(profile.name().to_string()) {
                return Err(ConfigError::DuplicateProfile(profile.name().to_string()));
            }
            if let Some(plugin) = profile
                .plugins()
                .iter()
                .find(|plugin| !plugin_names.contains(plugin.as_str()))
            {
                return Err(ConfigError::PluginNotConfigured {
                    profile: profile.name().to_string(),
                    plugin: plugin.clone(),
                });
            }
            if profile.reader_group_reference() == Some("") {
                return Err(ConfigError::EmptyName("reader group reference"));
            }
            if let Err(source) = profile.compile_reader_name_filter() {
                return Err(ConfigError::InvalidReaderNameRegex {
                    profile: profile.name().to_string(),
                    regex: profile.reader_name_regex().unwrap_or_default().to_string(),
                    source,
                });
            }
            profiles.push(profile);
        }

        Ok(CardResourceServiceConfig {
            regular_plugins: self.regular_plugins,
            pool_plugins: self.pool_plugins,
            strategy: self.strategy,
            mode: self.mode,
            usage_timeout: self.usage_timeout,
            pool_first: self.pool_first,
            profiles,
        })
    }
}
