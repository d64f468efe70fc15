//! Example allocating a card resource from the local PC/SC readers
//!
//! Run with `RUST_LOG=debug cargo run --example pcsc_allocate --features pcsc`

use std::sync::Arc;
use std::time::Duration;

use nexum_card_resource::pcsc::{PcscPlugin, PcscReaderConfigurator};
use nexum_card_resource::{
    AllocationStrategy, AtrProfileExtension, CardProfile, CardResourceService,
    CardResourceServiceConfig, PluginError, RegularPluginConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let plugin = Arc::new(PcscPlugin::new()?);
    let config = CardResourceServiceConfig::builder()
        .add_plugin_with_config(
            RegularPluginConfig::new(plugin, PcscReaderConfigurator::new())
                .with_plugin_monitoring(|plugin: &str, error: &PluginError| {
                    eprintln!("Plugin {plugin} observation failed: {error}");
                })
                .with_reader_monitoring(|_: &str, reader: &str, error: &PluginError| {
                    eprintln!("Reader {reader} observation failed: {error}");
                }),
        )
        // Any ISO 7816 card, direct or inverse convention
        .add_profile(CardProfile::new("any", AtrProfileExtension::new(vec![0x3B])))
        .add_profile(CardProfile::new("inverse", AtrProfileExtension::new(vec![0x3F])))
        .with_allocation_strategy(AllocationStrategy::Cyclic)
        .with_blocking_allocation_mode(Duration::from_millis(100), Duration::from_secs(10))
        .build()?;

    let service = CardResourceService::new();
    service.configure(config)?;
    service.start()?;

    println!("Waiting up to 10s for a card...");
    match service.get_card_resource("any")? {
        Some(resource) => {
            println!("Allocated {resource}");
            // GET CHALLENGE
            match resource.reader().transmit_apdu(&[0x00, 0x84, 0x00, 0x00, 0x08]) {
                Ok(response) => println!("Response: {}", hex::encode_upper(&response)),
                Err(error) => println!("Transmit failed: {error}"),
            }
            service.release_card_resource(&resource)?;
        }
        None => println!("No card available"),
    }

    service.stop();
    Ok(())
}
