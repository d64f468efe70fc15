//! Shared mocks for the card resource service tests

#![allow(dead_code)]

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nexum_card_resource::{
    DetectionMode, IdentifiedCard, ObservablePlugin, ObservableReader, Plugin, PluginError,
    PoolPlugin, Reader, SourceEvent, SourceEventSender,
};
use parking_lot::{Mutex, RwLock};

/// Status word appended to every mock response
pub const SW_OK: [u8; 2] = [0x90, 0x00];

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or two seconds elapse
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// An inserted mock card
#[derive(Debug, Clone)]
struct MockCard {
    atr: Bytes,
    fci: Bytes,
}

/// In-memory reader whose card can be swapped at will
#[derive(Debug)]
pub struct MockReader {
    name: String,
    card: Mutex<Option<MockCard>>,
    observable: bool,
    detection: Mutex<Option<SourceEventSender>>,
    detection_starts: AtomicUsize,
    configured: AtomicUsize,
    fail_detection: bool,
}

impl MockReader {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, true, false)
    }

    pub fn unobservable(name: &str) -> Arc<Self> {
        Self::build(name, false, false)
    }

    /// Reader whose card detection cannot start
    pub fn failing(name: &str) -> Arc<Self> {
        Self::build(name, true, true)
    }

    fn build(name: &str, observable: bool, fail_detection: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            card: Mutex::new(None),
            observable,
            detection: Mutex::new(None),
            detection_starts: AtomicUsize::new(0),
            configured: AtomicUsize::new(0),
            fail_detection,
        })
    }

    pub fn with_card(self: Arc<Self>, atr: &[u8], fci: &[u8]) -> Arc<Self> {
        self.insert(atr, fci);
        self
    }

    pub fn insert(&self, atr: &[u8], fci: &[u8]) {
        *self.card.lock() = Some(MockCard {
            atr: Bytes::copy_from_slice(atr),
            fci: Bytes::copy_from_slice(fci),
        });
    }

    pub fn remove(&self) {
        self.card.lock().take();
    }

    pub fn detection_starts(&self) -> usize {
        self.detection_starts.load(Ordering::SeqCst)
    }

    pub fn is_detecting(&self) -> bool {
        self.detection.lock().is_some()
    }

    pub fn configured(&self) -> usize {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn mark_configured(&self) {
        self.configured.fetch_add(1, Ordering::SeqCst);
    }

    /// Post an event through the sender given at detection start
    pub fn post(&self, event: SourceEvent) -> bool {
        self.detection
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(event).is_ok())
    }
}

impl Reader for MockReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_on_data(&self) -> Option<Bytes> {
        self.card.lock().as_ref().map(|card| card.atr.clone())
    }

    fn transmit_apdu(&self, command: &[u8]) -> Result<Bytes, PluginError> {
        let card = self
            .card
            .lock()
            .clone()
            .ok_or_else(|| PluginError::NoCard(self.name.clone()))?;
        // SELECT answers with the FCI, anything else with a bare status word
        let mut response = if command.get(1) == Some(&0xA4) {
            card.fci.to_vec()
        } else {
            Vec::new()
        };
        response.extend_from_slice(&SW_OK);
        Ok(Bytes::from(response))
    }

    fn as_observable(&self) -> Option<&dyn ObservableReader> {
        self.observable.then_some(self as &dyn ObservableReader)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ObservableReader for MockReader {
    fn start_card_detection(
        &self,
        _mode: DetectionMode,
        events: SourceEventSender,
    ) -> Result<(), PluginError> {
        if self.fail_detection {
            return Err(PluginError::io(self.name.clone(), "detection unavailable"));
        }
        self.detection_starts.fetch_add(1, Ordering::SeqCst);
        *self.detection.lock() = Some(events);
        Ok(())
    }

    fn stop_card_detection(&self) {
        self.detection.lock().take();
    }
}

/// In-memory observable plugin
#[derive(Debug)]
pub struct MockPlugin {
    name: String,
    readers: RwLock<Vec<Arc<MockReader>>>,
    observers: Mutex<Vec<SourceEventSender>>,
    fail_observation: bool,
}

impl MockPlugin {
    pub fn new(name: &str, readers: Vec<Arc<MockReader>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            readers: RwLock::new(readers),
            observers: Mutex::new(Vec::new()),
            fail_observation: false,
        })
    }

    /// Plugin whose observation cannot start
    pub fn failing(name: &str, readers: Vec<Arc<MockReader>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            readers: RwLock::new(readers),
            observers: Mutex::new(Vec::new()),
            fail_observation: true,
        })
    }

    /// Add a reader without notifying anyone
    pub fn plug(&self, reader: Arc<MockReader>) {
        self.readers.write().push(reader);
    }

    /// Remove a reader without notifying anyone
    pub fn unplug(&self, name: &str) {
        self.readers.write().retain(|reader| reader.name() != name);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Post an event to every observer
    pub fn post(&self, event: impl Fn() -> SourceEvent) {
        for observer in self.observers.lock().iter() {
            let _ = observer.send(event());
        }
    }
}

impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn readers(&self) -> Result<Vec<Arc<dyn Reader>>, PluginError> {
        Ok(self
            .readers
            .read()
            .iter()
            .map(|reader| Arc::clone(reader) as Arc<dyn Reader>)
            .collect())
    }

    fn reader(&self, name: &str) -> Option<Arc<dyn Reader>> {
        self.readers
            .read()
            .iter()
            .find(|reader| reader.name() == name)
            .map(|reader| Arc::clone(reader) as Arc<dyn Reader>)
    }

    fn as_observable(&self) -> Option<&dyn ObservablePlugin> {
        Some(self)
    }
}

impl ObservablePlugin for MockPlugin {
    fn add_observer(&self, events: SourceEventSender) -> Result<(), PluginError> {
        if self.fail_observation {
            return Err(PluginError::io(self.name.clone(), "observation unavailable"));
        }
        self.observers.lock().push(events);
        Ok(())
    }

    fn remove_observers(&self) {
        self.observers.lock().clear();
    }
}

/// Pool plugin lending readers from a queue
#[derive(Debug)]
pub struct MockPoolPlugin {
    name: String,
    groups: BTreeSet<String>,
    available: Mutex<VecDeque<Arc<dyn Reader>>>,
    allocations: AtomicUsize,
    releases: AtomicUsize,
}

impl MockPoolPlugin {
    pub fn new(name: &str, readers: Vec<Arc<MockReader>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            groups: BTreeSet::from(["default".to_string()]),
            available: Mutex::new(
                readers
                    .into_iter()
                    .map(|reader| reader as Arc<dyn Reader>)
                    .collect(),
            ),
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.available.lock().len()
    }
}

impl PoolPlugin for MockPoolPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn reader_group_references(&self) -> Result<BTreeSet<String>, PluginError> {
        Ok(self.groups.clone())
    }

    fn allocate_reader(
        &self,
        _group_reference: Option<&str>,
    ) -> Result<Option<Arc<dyn Reader>>, PluginError> {
        let reader = self.available.lock().pop_front();
        if reader.is_some() {
            self.allocations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(reader)
    }

    fn release_reader(&self, reader: &Arc<dyn Reader>) -> Result<(), PluginError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.available.lock().push_back(Arc::clone(reader));
        Ok(())
    }
}

/// Profile extension selecting the card and keeping the FCI
pub fn select_extension(
    atr_prefix: &'static [u8],
) -> impl Fn(&dyn Reader) -> Option<IdentifiedCard> + Send + Sync + 'static {
    move |reader: &dyn Reader| {
        let atr = reader.power_on_data()?;
        if !atr.starts_with(atr_prefix) {
            return None;
        }
        let response = reader
            .transmit_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x00])
            .ok()?;
        let fci = response.slice(..response.len().saturating_sub(2));
        Some(IdentifiedCard::new(atr).with_selection_response(fci))
    }
}
