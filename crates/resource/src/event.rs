//! Events posted by plugins and readers to the card resource service

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::PluginError;

/// Notification emitted by an observable plugin or reader
#[derive(Debug)]
pub enum SourceEvent {
    /// A reader was connected to a plugin
    ReaderConnected {
        /// Plugin name
        plugin: String,
        /// Reader name
        reader: String,
    },
    /// A reader was disconnected from a plugin
    ReaderDisconnected {
        /// Plugin name
        plugin: String,
        /// Reader name
        reader: String,
    },
    /// A card was inserted into a reader
    CardInserted {
        /// Reader name
        reader: String,
    },
    /// A card matching a scheduled selection scenario was inserted
    CardMatched {
        /// Reader name
        reader: String,
    },
    /// A card was removed from a reader
    CardRemoved {
        /// Reader name
        reader: String,
    },
    /// The reader is no longer registered for observation
    ReaderUnregistered {
        /// Reader name
        reader: String,
    },
    /// Observation failed inside a plugin or reader monitoring thread
    ObservationFailed {
        /// Plugin name
        plugin: String,
        /// Reader name, when the failure is reader-scoped
        reader: Option<String>,
        /// Failure
        error: PluginError,
    },
}

impl SourceEvent {
    /// Name of the reader the event is about, if any
    pub fn reader_name(&self) -> Option<&str> {
        match self {
            Self::ReaderConnected { reader, .. }
            | Self::ReaderDisconnected { reader, .. }
            | Self::CardInserted { reader }
            | Self::CardMatched { reader }
            | Self::CardRemoved { reader }
            | Self::ReaderUnregistered { reader } => Some(reader),
            Self::ObservationFailed { reader, .. } => reader.as_deref(),
        }
    }
}

/// Sender for source events
pub type SourceEventSender = Sender<SourceEvent>;
/// Receiver for source events
pub type SourceEventReceiver = Receiver<SourceEvent>;

/// Create an unbounded channel for source events
pub fn source_event_channel() -> (SourceEventSender, SourceEventReceiver) {
    unbounded()
}
