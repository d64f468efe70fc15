//! Event coordinator thread of a running service

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded, select};
use tracing::{debug, error, trace};

use crate::event::SourceEventReceiver;
use crate::service::ServiceState;

/// Background thread feeding plugin events to the service state
#[derive(Debug)]
pub(crate) struct ServiceMonitor {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceMonitor {
    /// Spawn the coordinator; events are processed one at a time, in arrival order
    pub(crate) fn spawn(state: Arc<ServiceState>, events: SourceEventReceiver) -> Self {
        let (stop, stopped) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("card-resource-events".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(stopped) -> _ => break,
                        recv(events) -> event => match event {
                            Ok(event) => {
                                trace!(?event, "Processing event");
                                state.dispatch(event);
                            }
                            Err(_) => break,
                        },
                    }
                }
                debug!("Event coordinator exited");
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(error) => {
                error!(%error, "Failed to spawn the event coordinator");
                None
            }
        };

        Self { stop, handle }
    }

    /// Stop the coordinator and wait for the event being processed, if any
    pub(crate) fn shutdown(mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Event coordinator panicked");
            }
        }
    }
}
