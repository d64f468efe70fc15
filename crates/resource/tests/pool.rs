//! Allocation from pool plugins

mod common;

use std::sync::Arc;

use common::{MockPlugin, MockPoolPlugin, MockReader, init_tracing};
use nexum_card_resource::{
    AtrProfileExtension, CardProfile, CardResourceService, CardResourceServiceConfig, Reader,
};

const ATR: [u8; 2] = [0x3B, 0x10];
const OTHER_ATR: [u8; 2] = [0x3C, 0x10];
const FCI: [u8; 1] = [0x6F];

fn profile() -> CardProfile {
    CardProfile::new("p", AtrProfileExtension::new(vec![0x3B])).with_reader_group_reference("default")
}

fn start(config: CardResourceServiceConfig) -> CardResourceService {
    init_tracing();
    let service = CardResourceService::new();
    service.configure(config).unwrap();
    service.start().unwrap();
    service
}

#[test]
fn test_pool_used_when_no_regular_resource() {
    let pool = MockPoolPlugin::new("POOL", vec![MockReader::new("PR1").with_card(&ATR, &FCI)]);
    let service = start(
        CardResourceServiceConfig::builder()
            .add_plugin(MockPlugin::new("P", vec![MockReader::new("R1")]), |_: &dyn Reader| {})
            .add_pool_plugin(Arc::clone(&pool) as _)
            .add_profile(profile())
            .build()
            .unwrap(),
    );

    let resource = service.get_card_resource("p").unwrap().unwrap();
    assert_eq!(resource.reader_name(), "PR1");
    assert_eq!(pool.allocations(), 1);
    assert!(service.get_card_resource("p").unwrap().is_none());

    service.release_card_resource(&resource).unwrap();
    service.release_card_resource(&resource).unwrap();
    assert_eq!(pool.releases(), 1);
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_regular_plugins_searched_first_by_default() {
    let pool = MockPoolPlugin::new("POOL", vec![MockReader::new("PR1").with_card(&ATR, &FCI)]);
    let service = start(
        CardResourceServiceConfig::builder()
            .add_plugin(
                MockPlugin::new("P", vec![MockReader::new("R1").with_card(&ATR, &FCI)]),
                |_: &dyn Reader| {},
            )
            .add_pool_plugin(Arc::clone(&pool) as _)
            .add_profile(profile())
            .build()
            .unwrap(),
    );

    let resource = service.get_card_resource("p").unwrap().unwrap();
    assert_eq!(resource.reader_name(), "R1");
    assert_eq!(pool.allocations(), 0);
}

#[test]
fn test_pool_first() {
    let pool = MockPoolPlugin::new("POOL", vec![MockReader::new("PR1").with_card(&ATR, &FCI)]);
    let service = start(
        CardResourceServiceConfig::builder()
            .add_plugin(
                MockPlugin::new("P", vec![MockReader::new("R1").with_card(&ATR, &FCI)]),
                |_: &dyn Reader| {},
            )
            .add_pool_plugin(Arc::clone(&pool) as _)
            .with_pool_first(true)
            .add_profile(profile())
            .build()
            .unwrap(),
    );

    let first = service.get_card_resource("p").unwrap().unwrap();
    let second = service.get_card_resource("p").unwrap().unwrap();
    assert_eq!(first.reader_name(), "PR1");
    assert_eq!(second.reader_name(), "R1");
}

#[test]
fn test_non_matching_pool_reader_is_given_back() {
    let pool = MockPoolPlugin::new(
        "POOL",
        vec![MockReader::new("PR1").with_card(&OTHER_ATR, &FCI)],
    );
    let service = start(
        CardResourceServiceConfig::builder()
            .add_pool_plugin(Arc::clone(&pool) as _)
            .add_profile(profile())
            .build()
            .unwrap(),
    );

    assert!(service.get_card_resource("p").unwrap().is_none());
    assert_eq!(pool.allocations(), 1);
    assert_eq!(pool.releases(), 1);
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_profile_scoped_to_pool_plugin() {
    let pool = MockPoolPlugin::new("POOL", vec![MockReader::new("PR1").with_card(&ATR, &FCI)]);
    let service = start(
        CardResourceServiceConfig::builder()
            .add_plugin(
                MockPlugin::new("P", vec![MockReader::new("R1").with_card(&ATR, &FCI)]),
                |_: &dyn Reader| {},
            )
            .add_pool_plugin(Arc::clone(&pool) as _)
            .add_profile(profile().with_plugins(["POOL"]))
            .build()
            .unwrap(),
    );

    let resource = service.get_card_resource("p").unwrap().unwrap();
    assert_eq!(resource.reader_name(), "PR1");
    assert!(service.get_card_resource("p").unwrap().is_none());
}

#[test]
fn test_removed_pool_resource_is_given_back() {
    let pool = MockPoolPlugin::new("POOL", vec![MockReader::new("PR1").with_card(&ATR, &FCI)]);
    let service = start(
        CardResourceServiceConfig::builder()
            .add_pool_plugin(Arc::clone(&pool) as _)
            .add_profile(profile())
            .build()
            .unwrap(),
    );

    let resource = service.get_card_resource("p").unwrap().unwrap();
    service.remove_card_resource(&resource).unwrap();
    assert_eq!(pool.releases(), 1);

    // The pool lends the reader again, under a fresh resource
    let again = service.get_card_resource("p").unwrap().unwrap();
    assert_eq!(again.reader_name(), "PR1");
    assert_ne!(again, resource);
}
