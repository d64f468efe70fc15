//! Traits implemented by reader plugins consumed by the card resource service
//!
//! Regular plugins expose a set of readers that persist until disconnected and
//! may be observed. Pool plugins lend readers on demand, per group reference.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PluginError;
use crate::event::SourceEventSender;

/// A reader capable of exchanging data with a smart card
pub trait Reader: Send + Sync + fmt::Debug {
    /// Reader name, unique across the configured plugins
    fn name(&self) -> &str;

    /// Power-on data (ATR) of the inserted card, or `None` without a card
    fn power_on_data(&self) -> Option<Bytes>;

    /// Send a raw APDU to the inserted card and return the raw response
    fn transmit_apdu(&self, command: &[u8]) -> Result<Bytes, PluginError>;

    /// Card insertion and removal observation, when supported
    fn as_observable(&self) -> Option<&dyn ObservableReader> {
        None
    }

    /// Access to the concrete reader type, for plugin-specific configuration
    fn as_any(&self) -> &dyn Any;
}

/// How an observable reader resumes card detection after a card is removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetectionMode {
    /// Keep waiting for new cards after each removal
    #[default]
    Repeating,
    /// Stop detection after the first removal
    SingleShot,
}

/// A reader able to notify card insertion and removal
pub trait ObservableReader: Send + Sync {
    /// Start posting [`SourceEvent`](crate::SourceEvent)s for this reader to `events`
    fn start_card_detection(
        &self,
        mode: DetectionMode,
        events: SourceEventSender,
    ) -> Result<(), PluginError>;

    /// Stop card detection; no-op when not started
    fn stop_card_detection(&self);
}

/// A provider of persistent readers
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Plugin name
    fn name(&self) -> &str;

    /// Readers currently connected to the plugin
    fn readers(&self) -> Result<Vec<Arc<dyn Reader>>, PluginError>;

    /// Look up a connected reader by name
    fn reader(&self, name: &str) -> Option<Arc<dyn Reader>>;

    /// Reader connection and disconnection observation, when supported
    fn as_observable(&self) -> Option<&dyn ObservablePlugin> {
        None
    }
}

/// A plugin able to notify reader connection and disconnection
pub trait ObservablePlugin: Send + Sync {
    /// Start posting [`SourceEvent`](crate::SourceEvent)s for this plugin to `events`
    fn add_observer(&self, events: SourceEventSender) -> Result<(), PluginError>;

    /// Stop posting events to every registered observer
    fn remove_observers(&self);
}

/// A provider of readers lent on demand
pub trait PoolPlugin: Send + Sync + fmt::Debug {
    /// Plugin name
    fn name(&self) -> &str;

    /// Group references the pool can allocate readers from
    fn reader_group_references(&self) -> Result<BTreeSet<String>, PluginError>;

    /// Allocate a reader from the given group, or from any group with `None`.
    ///
    /// Returns `Ok(None)` when the pool has nothing left to lend.
    fn allocate_reader(
        &self,
        group_reference: Option<&str>,
    ) -> Result<Option<Arc<dyn Reader>>, PluginError>;

    /// Give an allocated reader back to the pool
    fn release_reader(&self, reader: &Arc<dyn Reader>) -> Result<(), PluginError>;
}

/// Source-specific setup applied once to each newly registered reader
pub trait ReaderConfigurator: Send + Sync {
    /// Configure the reader (protocol, sharing mode...)
    fn setup_reader(&self, reader: &dyn Reader);
}

impl<F> ReaderConfigurator for F
where
    F: Fn(&dyn Reader) + Send + Sync,
{
    fn setup_reader(&self, reader: &dyn Reader) {
        self(reader)
    }
}

/// Handler for errors raised while observing a plugin
pub trait PluginObservationExceptionHandler: Send + Sync {
    /// Handle an observation error
    fn on_plugin_observation_error(&self, plugin: &str, error: &PluginError);
}

impl<F> PluginObservationExceptionHandler for F
where
    F: Fn(&str, &PluginError) + Send + Sync,
{
    fn on_plugin_observation_error(&self, plugin: &str, error: &PluginError) {
        self(plugin, error)
    }
}

/// Handler for errors raised while observing a reader
pub trait ReaderObservationExceptionHandler: Send + Sync {
    /// Handle an observation error
    fn on_reader_observation_error(&self, plugin: &str, reader: &str, error: &PluginError);
}

impl<F> ReaderObservationExceptionHandler for F
where
    F: Fn(&str, &str, &PluginError) + Send + Sync,
{
    fn on_reader_observation_error(&self, plugin: &str, reader: &str, error: &PluginError) {
        self(plugin, reader, error)
    }
}

/// A configured plugin, either regular or pool
#[derive(Clone)]
pub enum ConfiguredPlugin {
    /// Plugin with persistent readers
    Regular(Arc<dyn Plugin>),
    /// Plugin lending readers on demand
    Pool(Arc<dyn PoolPlugin>),
}

impl ConfiguredPlugin {
    /// Plugin name
    pub fn name(&self) -> &str {
        match self {
            Self::Regular(plugin) => plugin.name(),
            Self::Pool(plugin) => plugin.name(),
        }
    }
}

impl fmt::Debug for ConfiguredPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular(plugin) => f.debug_tuple("Regular").field(&plugin.name()).finish(),
            Self::Pool(plugin) => f.debug_tuple("Pool").field(&plugin.name()).finish(),
        }
    }
}
