//! PC/SC backed plugin and readers

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, trace, warn};

use crate::error::PluginError;
use crate::event::{SourceEvent, SourceEventSender};
use crate::plugin::{
    DetectionMode, ObservablePlugin, ObservableReader, Plugin, Reader, ReaderConfigurator,
};

/// Interval between two scans of the reader list
const READER_SCAN_INTERVAL: Duration = Duration::from_millis(500);
/// Maximum wait for a card status change before checking the stop flag
const CARD_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Plugin exposing the readers of the local PC/SC subsystem
pub struct PcscPlugin {
    shared: Arc<PluginShared>,
    watcher: Mutex<Option<Watcher>>,
}

struct PluginShared {
    name: String,
    context: Context,
    readers: RwLock<HashMap<String, Arc<PcscReader>>>,
    observers: Mutex<Vec<SourceEventSender>>,
}

/// A polling thread with its stop flag
struct Watcher {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watcher {
    fn spawn<F>(name: String, body: F) -> Result<Self, PluginError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))
            .map_err(|error| PluginError::io(name, error.to_string()))?;
        Ok(Self { running, handle })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Release);
        if self.handle.join().is_err() {
            warn!("PC/SC watcher panicked");
        }
    }
}

impl PcscPlugin {
    /// Name used when none is given
    pub const DEFAULT_NAME: &'static str = "PcscPlugin";

    /// Establish a PC/SC context
    pub fn new() -> Result<Self, PluginError> {
        Self::with_name(Self::DEFAULT_NAME)
    }

    /// Establish a PC/SC context for a plugin with a custom name
    pub fn with_name(name: impl Into<String>) -> Result<Self, PluginError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self {
            shared: Arc::new(PluginShared {
                name: name.into(),
                context,
                readers: RwLock::default(),
                observers: Mutex::default(),
            }),
            watcher: Mutex::new(None),
        })
    }
}

impl PluginShared {
    fn list_reader_names(&self) -> Result<Vec<String>, PluginError> {
        match self.context.list_readers_owned() {
            Ok(readers) => Ok(readers
                .iter()
                .map(|reader| reader.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn get_or_create_reader(&self, name: &str) -> Arc<PcscReader> {
        if let Some(reader) = self.readers.read().get(name) {
            return Arc::clone(reader);
        }
        let reader = Arc::new(PcscReader::new(
            self.context.clone(),
            name.to_string(),
            self.name.clone(),
        ));
        Arc::clone(
            self.readers
                .write()
                .entry(name.to_string())
                .or_insert(reader),
        )
    }

    fn post(&self, event: impl Fn() -> SourceEvent) {
        self.observers
            .lock()
            .retain(|observer| observer.send(event()).is_ok());
    }

    /// Diff the reader list against the known readers and post the changes
    fn scan(&self) -> Result<(), PluginError> {
        let current = self.list_reader_names()?;

        for name in &current {
            if !self.readers.read().contains_key(name) {
                self.get_or_create_reader(name);
                debug!(plugin = self.name, reader = name, "Reader connected");
                self.post(|| SourceEvent::ReaderConnected {
                    plugin: self.name.clone(),
                    reader: name.clone(),
                });
            }
        }

        let gone: Vec<String> = self
            .readers
            .read()
            .keys()
            .filter(|name| !current.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(reader) = self.readers.write().remove(&name) {
                reader.stop_card_detection();
            }
            debug!(plugin = self.name, reader = name, "Reader disconnected");
            self.post(|| SourceEvent::ReaderDisconnected {
                plugin: self.name.clone(),
                reader: name.clone(),
            });
        }
        Ok(())
    }

    fn watch(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            if let Err(error) = self.scan() {
                warn!(plugin = self.name, %error, "Reader scan failed");
                self.post(|| SourceEvent::ObservationFailed {
                    plugin: self.name.clone(),
                    reader: None,
                    error: PluginError::io(self.name.clone(), error.to_string()),
                });
            }
            thread::sleep(READER_SCAN_INTERVAL);
        }
    }
}

impl Plugin for PcscPlugin {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn readers(&self) -> Result<Vec<Arc<dyn Reader>>, PluginError> {
        let names = self.shared.list_reader_names()?;
        Ok(names
            .iter()
            .map(|name| self.shared.get_or_create_reader(name) as Arc<dyn Reader>)
            .collect())
    }

    fn reader(&self, name: &str) -> Option<Arc<dyn Reader>> {
        if let Some(reader) = self.shared.readers.read().get(name) {
            return Some(Arc::clone(reader) as Arc<dyn Reader>);
        }
        let present = self
            .shared
            .list_reader_names()
            .ok()?
            .iter()
            .any(|reader| reader == name);
        present.then(|| self.shared.get_or_create_reader(name) as Arc<dyn Reader>)
    }

    fn as_observable(&self) -> Option<&dyn ObservablePlugin> {
        Some(self)
    }
}

impl ObservablePlugin for PcscPlugin {
    fn add_observer(&self, events: SourceEventSender) -> Result<(), PluginError> {
        self.shared.observers.lock().push(events);

        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            // Readers known before observation starts are not reported as connected
            for name in self.shared.list_reader_names()? {
                self.shared.get_or_create_reader(&name);
            }
            let shared = Arc::clone(&self.shared);
            *watcher = Some(Watcher::spawn(
                format!("pcsc-plugin-{}", self.shared.name),
                move |running| shared.watch(&running),
            )?);
        }
        Ok(())
    }

    fn remove_observers(&self) {
        self.shared.observers.lock().clear();
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }
}

impl Drop for PcscPlugin {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.stop();
        }
    }
}

impl fmt::Debug for PcscPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscPlugin")
            .field("name", &self.shared.name)
            .field("readers", &self.shared.readers.read().len())
            .field("observed", &self.watcher.lock().is_some())
            .finish()
    }
}

/// Connection parameters of a PC/SC reader
#[derive(Debug, Clone, Copy)]
struct Connection {
    share_mode: ShareMode,
    protocols: Protocols,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            protocols: Protocols::ANY,
        }
    }
}

/// A PC/SC reader; the card is connected on first transmission
pub struct PcscReader {
    name: String,
    plugin: String,
    context: Context,
    connection: Mutex<Connection>,
    card: Mutex<Option<Card>>,
    detection: Mutex<Option<Watcher>>,
}

impl PcscReader {
    fn new(context: Context, name: String, plugin: String) -> Self {
        Self {
            name,
            plugin,
            context,
            connection: Mutex::default(),
            card: Mutex::new(None),
            detection: Mutex::new(None),
        }
    }

    /// Set the sharing mode and protocols of future card connections
    pub fn configure(&self, share_mode: ShareMode, protocols: Protocols) {
        *self.connection.lock() = Connection {
            share_mode,
            protocols,
        };
        // Reconnect with the new parameters on next use
        if let Some(card) = self.card.lock().take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
    }

    fn c_name(&self) -> Result<CString, PluginError> {
        CString::new(self.name.clone()).map_err(|_| PluginError::ReaderNotFound(self.name.clone()))
    }

    fn connect(&self, slot: &mut Option<Card>) -> Result<(), PluginError> {
        if slot.is_some() {
            return Ok(());
        }
        let connection = *self.connection.lock();
        match self
            .context
            .connect(&self.c_name()?, connection.share_mode, connection.protocols)
        {
            Ok(card) => {
                *slot = Some(card);
                Ok(())
            }
            Err(pcsc::Error::NoSmartcard) => Err(PluginError::NoCard(self.name.clone())),
            Err(error) => Err(error.into()),
        }
    }
}

/// Post card insertions and removals of one reader until stopped
fn detect(
    context: &Context,
    plugin: &str,
    reader: &str,
    c_name: &CStr,
    mode: DetectionMode,
    events: &SourceEventSender,
    running: &AtomicBool,
) {
    let mut states = [ReaderState::new(c_name, State::UNAWARE)];
    let mut present = false;

    while running.load(Ordering::Acquire) {
        match context.get_status_change(Some(CARD_POLL_TIMEOUT), &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(error) => {
                let _ = events.send(SourceEvent::ObservationFailed {
                    plugin: plugin.to_string(),
                    reader: Some(reader.to_string()),
                    error: error.into(),
                });
                // Reader disappearance is reported by the plugin scan
                break;
            }
        }

        let state = states[0].event_state();
        states[0].sync_current_state();
        let now_present = state.contains(State::PRESENT) && !state.contains(State::EMPTY);
        trace!(reader, ?state, "Card status changed");
        if now_present == present {
            continue;
        }
        present = now_present;

        let event = if present {
            SourceEvent::CardInserted {
                reader: reader.to_string(),
            }
        } else {
            SourceEvent::CardRemoved {
                reader: reader.to_string(),
            }
        };
        if events.send(event).is_err() {
            break;
        }
        if !present && mode == DetectionMode::SingleShot {
            debug!(reader, "Single shot detection complete");
            break;
        }
    }
}

impl Reader for PcscReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_on_data(&self) -> Option<Bytes> {
        let mut states = [ReaderState::new(self.c_name().ok()?, State::UNAWARE)];
        self.context.get_status_change(None, &mut states).ok()?;
        let state = states[0].event_state();
        (state.contains(State::PRESENT) && !state.contains(State::EMPTY))
            .then(|| Bytes::copy_from_slice(states[0].atr()))
    }

    fn transmit_apdu(&self, command: &[u8]) -> Result<Bytes, PluginError> {
        let mut slot = self.card.lock();
        self.connect(&mut slot)?;
        let Some(card) = slot.as_ref() else {
            return Err(PluginError::NoCard(self.name.clone()));
        };

        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        match card.transmit(command, &mut buffer) {
            Ok(response) => Ok(Bytes::copy_from_slice(response)),
            Err(error) => {
                if matches!(error, pcsc::Error::ResetCard | pcsc::Error::RemovedCard) {
                    slot.take();
                }
                Err(error.into())
            }
        }
    }

    fn as_observable(&self) -> Option<&dyn ObservableReader> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ObservableReader for PcscReader {
    fn start_card_detection(
        &self,
        mode: DetectionMode,
        events: SourceEventSender,
    ) -> Result<(), PluginError> {
        let mut detection = self.detection.lock();
        if let Some(previous) = detection.take() {
            previous.stop();
        }

        let c_name = self.c_name()?;
        let context = self.context.clone();
        let plugin = self.plugin.clone();
        let reader = self.name.clone();
        *detection = Some(Watcher::spawn(
            format!("pcsc-reader-{}", self.name),
            move |running| detect(&context, &plugin, &reader, &c_name, mode, &events, &running),
        )?);
        Ok(())
    }

    fn stop_card_detection(&self) {
        if let Some(watcher) = self.detection.lock().take() {
            watcher.stop();
        }
    }
}

impl Drop for PcscReader {
    fn drop(&mut self) {
        if let Some(watcher) = self.detection.get_mut().take() {
            watcher.stop();
        }
        if let Some(card) = self.card.get_mut().take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
    }
}

impl fmt::Debug for PcscReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscReader")
            .field("name", &self.name)
            .field("plugin", &self.plugin)
            .field("connection", &*self.connection.lock())
            .field("connected", &self.card.lock().is_some())
            .finish()
    }
}

/// Reader configurator applying connection parameters to PC/SC readers
#[derive(Debug, Clone, Copy)]
pub struct PcscReaderConfigurator {
    share_mode: ShareMode,
    protocols: Protocols,
}

impl Default for PcscReaderConfigurator {
    fn default() -> Self {
        let connection = Connection::default();
        Self {
            share_mode: connection.share_mode,
            protocols: connection.protocols,
        }
    }
}

impl PcscReaderConfigurator {
    /// Shared mode, any protocol
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sharing mode
    pub const fn with_share_mode(mut self, share_mode: ShareMode) -> Self {
        self.share_mode = share_mode;
        self
    }

    /// Set the accepted protocols
    pub const fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }
}

impl ReaderConfigurator for PcscReaderConfigurator {
    fn setup_reader(&self, reader: &dyn Reader) {
        match reader.as_any().downcast_ref::<PcscReader>() {
            Some(reader) => {
                debug!(reader = reader.name, share_mode = ?self.share_mode, "Configuring PC/SC reader");
                reader.configure(self.share_mode, self.protocols);
            }
            None => warn!(reader = reader.name(), "Not a PC/SC reader, left unconfigured"),
        }
    }
}
