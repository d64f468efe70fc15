//! Allocation of exclusive smart card resources
//!
//! A card resource is a card identified by a profile in a specific reader.
//! The [`CardResourceService`] tracks readers and cards across plugins, hands
//! out one resource per reader at a time and keeps its view current as readers
//! and cards come and go.
//!
//! # Features
//!
//! - `pcsc`: PC/SC backed [`pcsc::PcscPlugin`] and reader configurator
//!
//! # Examples
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use nexum_card_resource::prelude::*;
//! # fn plugin() -> Arc<dyn Plugin> { unimplemented!() }
//! # fn main() -> Result<(), nexum_card_resource::Error> {
//! let config = CardResourceServiceConfig::builder()
//!     .add_plugin(plugin(), |_: &dyn Reader| {})
//!     .add_profile(
//!         CardProfile::new("sam", AtrProfileExtension::new(vec![0x3B, 0x3F]))
//!             .with_reader_name_regex(".*SAM.*"),
//!     )
//!     .with_allocation_strategy(AllocationStrategy::Cyclic)
//!     .with_default_blocking_allocation_mode()
//!     .build()?;
//!
//! let service = CardResourceService::new();
//! service.configure(config)?;
//! service.start()?;
//!
//! let resource = service.get_card_resource("sam")?;
//! if let Some(resource) = resource {
//!     let response = resource.reader().transmit_apdu(&[0x00, 0x84, 0x00, 0x00, 0x08]);
//!     println!("{response:?}");
//!     service.release_card_resource(&resource)?;
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod card;
mod config;
mod error;
pub mod event;
mod monitor;
mod plugin;
mod profile;
mod profile_manager;
mod reader_manager;
mod resource;
mod service;

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub use card::IdentifiedCard;
pub use config::{
    AllocationMode, AllocationSettings, AllocationStrategy, BlockingSettings,
    CardResourceServiceConfig, CardResourceServiceConfigBuilder, DEFAULT_ALLOCATION_TIMEOUT,
    DEFAULT_CYCLE_DURATION, DEFAULT_USAGE_TIMEOUT, RegularPluginConfig,
};
pub use error::{ConfigError, Error, PluginError, Result};
pub use event::{SourceEvent, SourceEventReceiver, SourceEventSender};
pub use plugin::{
    ConfiguredPlugin, DetectionMode, ObservablePlugin, ObservableReader, Plugin,
    PluginObservationExceptionHandler, PoolPlugin, Reader, ReaderConfigurator,
    ReaderObservationExceptionHandler,
};
pub use profile::{AtrProfileExtension, CardProfile, CardResourceProfileExtension};
pub use resource::CardResource;
pub use service::CardResourceService;

/// Commonly used types
pub mod prelude {
    pub use crate::{
        AllocationStrategy, AtrProfileExtension, CardProfile, CardResource,
        CardResourceProfileExtension, CardResourceService, CardResourceServiceConfig,
        IdentifiedCard, Plugin, PoolPlugin, Reader, RegularPluginConfig,
    };
}
