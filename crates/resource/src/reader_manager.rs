//! Per-reader state: known card resources and exclusive use

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::card::IdentifiedCard;
use crate::error::LockError;
use crate::plugin::Reader;
use crate::profile::CardResourceProfileExtension;
use crate::resource::CardResource;

/// Manager of one reader from a regular plugin
pub(crate) struct ReaderManager {
    /// The managed reader
    reader: Arc<dyn Reader>,
    /// Name of the plugin owning the reader
    plugin: String,
    /// Maximum time a client may hold the reader
    usage_timeout: Option<Duration>,
    /// Whether some profile accepted the reader
    active: AtomicBool,
    /// State guarded by the reader lock
    state: Mutex<ReaderState>,
}

#[derive(Default)]
struct ReaderState {
    /// Resources created for the cards seen in this reader
    resources: Vec<CardResource>,
    /// Resource matching the card the reader was last selected for
    selected: Option<CardResource>,
    /// Resource currently handed out to a client
    held: Option<Held>,
    /// Last lease granted on this reader
    leases: u64,
}

struct Held {
    resource: CardResource,
    lease: u64,
    since: Instant,
}

impl Held {
    /// Whether `resource` may give the reader back.
    ///
    /// Handles without a lease are the service's own and always qualify.
    fn is_held_by(&self, resource: &CardResource) -> bool {
        self.resource == *resource && (resource.lease() == 0 || resource.lease() == self.lease)
    }
}

impl ReaderManager {
    pub(crate) fn new(
        reader: Arc<dyn Reader>,
        plugin: impl Into<String>,
        usage_timeout: Option<Duration>,
    ) -> Self {
        Self {
            reader,
            plugin: plugin.into(),
            usage_timeout,
            active: AtomicBool::new(false),
            state: Mutex::new(ReaderState::default()),
        }
    }

    pub(crate) fn reader(&self) -> &Arc<dyn Reader> {
        &self.reader
    }

    pub(crate) fn reader_name(&self) -> &str {
        self.reader.name()
    }

    pub(crate) fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the reader as wanted by at least one profile
    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Take exclusive possession of the reader, blocking until available
    pub(crate) fn lock(&self) -> ReaderGuard<'_> {
        ReaderGuard {
            manager: self,
            state: self.state.lock(),
        }
    }
}

impl std::fmt::Debug for ReaderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderManager")
            .field("reader", &self.reader.name())
            .field("plugin", &self.plugin)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Exclusive possession of a reader
pub(crate) struct ReaderGuard<'a> {
    manager: &'a ReaderManager,
    state: MutexGuard<'a, ReaderState>,
}

impl ReaderGuard<'_> {
    /// Run the profile predicate against the inserted card and register the
    /// resulting resource, reusing an existing one for an equivalent card.
    ///
    /// Matching is skipped while a client holds the reader, since the
    /// predicate would interleave with the client's exchanges.
    pub(crate) fn try_match_and_register(
        &mut self,
        extension: &dyn CardResourceProfileExtension,
    ) -> Option<CardResource> {
        if let Some(held) = &self.state.held {
            debug!(
                reader = self.manager.reader_name(),
                resource = held.resource.id(),
                "Reader in use, match deferred"
            );
            return None;
        }

        let card = extension.matches(self.manager.reader.as_ref())?;
        let resource = self.get_or_create(card);
        self.state.selected = Some(resource.clone());
        Some(resource)
    }

    fn get_or_create(&mut self, card: IdentifiedCard) -> CardResource {
        if let Some(resource) = self
            .state
            .resources
            .iter()
            .find(|resource| resource.card().same_card(&card))
        {
            trace!(%resource, "Reusing existing card resource");
            return resource.clone();
        }

        let resource = CardResource::new(Arc::clone(&self.manager.reader), card);
        debug!(%resource, "Created card resource");
        self.state.resources.push(resource.clone());
        resource
    }

    /// Try to hand the reader out for `resource`, returning the handle stamped
    /// with a fresh lease.
    ///
    /// Returns `Ok(None)` when another client holds the reader. If the reader
    /// was last selected for a different resource, the predicate is run again
    /// to check the inserted card is still the one `resource` was built on.
    pub(crate) fn try_lock(
        &mut self,
        resource: &CardResource,
        extension: &dyn CardResourceProfileExtension,
    ) -> Result<Option<CardResource>, LockError> {
        if let Some(held) = &self.state.held {
            match self.manager.usage_timeout {
                Some(timeout) if held.since.elapsed() >= timeout => {
                    warn!(
                        reader = self.manager.reader_name(),
                        resource = held.resource.id(),
                        ?timeout,
                        "Usage timeout elapsed, forcing release"
                    );
                    self.state.held = None;
                }
                _ => return Ok(None),
            }
        }

        if self.state.selected.as_ref() != Some(resource) {
            match extension.matches(self.manager.reader.as_ref()) {
                Some(card) if card.same_card(resource.card()) => {}
                Some(_) => {
                    self.state.selected = None;
                    return Err(LockError::CardChanged);
                }
                None => {
                    self.state.selected = None;
                    return Err(LockError::Unusable);
                }
            }
            self.state.selected = Some(resource.clone());
        }

        self.state.leases += 1;
        let lease = self.state.leases;
        self.state.held = Some(Held {
            resource: resource.clone(),
            lease,
            since: Instant::now(),
        });
        Ok(Some(resource.with_lease(lease)))
    }

    /// Give the reader back if it is held under `resource`'s lease; no-op
    /// otherwise, including for a lease reclaimed after the usage timeout.
    pub(crate) fn unlock(&mut self, resource: &CardResource) {
        let Some(held) = &self.state.held else {
            return;
        };
        if held.is_held_by(resource) {
            self.state.held = None;
        } else if held.resource == *resource {
            debug!(
                %resource,
                lease = resource.lease(),
                current = held.lease,
                "Release ignored, lease was reclaimed"
            );
        }
    }

    /// Forget a resource
    pub(crate) fn remove_resource(&mut self, resource: &CardResource) {
        self.state.resources.retain(|known| known != resource);
        if self.state.selected.as_ref() == Some(resource) {
            self.state.selected = None;
        }
    }

    /// Snapshot of the known resources
    pub(crate) fn resources(&self) -> Vec<CardResource> {
        self.state.resources.clone()
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        self.state.held.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::error::PluginError;

    #[derive(Debug)]
    struct TestReader {
        name: String,
        atr: Mutex<Option<Bytes>>,
    }

    impl TestReader {
        fn with_card(name: &str, atr: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                atr: Mutex::new(Some(Bytes::from_static(atr))),
            })
        }

        fn insert(&self, atr: Option<&'static [u8]>) {
            *self.atr.lock() = atr.map(Bytes::from_static);
        }
    }

    impl Reader for TestReader {
        fn name(&self) -> &str {
            &self.name
        }

        fn power_on_data(&self) -> Option<Bytes> {
            self.atr.lock().clone()
        }

        fn transmit_apdu(&self, _command: &[u8]) -> Result<Bytes, PluginError> {
            Err(PluginError::Unsupported("transmit"))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn any_card(reader: &dyn Reader) -> Option<IdentifiedCard> {
        reader.power_on_data().map(IdentifiedCard::new)
    }

    #[test]
    fn test_match_reuses_equivalent_resource() {
        let manager = ReaderManager::new(TestReader::with_card("R", &[0x3B, 0x01]), "P", None);

        let first = manager.lock().try_match_and_register(&any_card).unwrap();
        let second = manager.lock().try_match_and_register(&any_card).unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.lock().resources().len(), 1);
        assert!(!manager.lock().is_busy());
    }

    #[test]
    fn test_no_match() {
        let manager = ReaderManager::new(TestReader::with_card("R", &[0x3B]), "P", None);
        let never = |_: &dyn Reader| -> Option<IdentifiedCard> { None };

        assert!(manager.lock().try_match_and_register(&never).is_none());
        assert!(manager.lock().resources().is_empty());
    }

    #[test]
    fn test_lock_is_exclusive_and_unlock_idempotent() {
        let manager = ReaderManager::new(TestReader::with_card("R", &[0x3B]), "P", None);
        let resource = manager.lock().try_match_and_register(&any_card).unwrap();

        let leased = manager.lock().try_lock(&resource, &any_card).unwrap().unwrap();
        assert_eq!(leased, resource);
        assert_eq!(manager.lock().try_lock(&resource, &any_card), Ok(None));

        manager.lock().unlock(&leased);
        manager.lock().unlock(&leased);
        assert!(!manager.lock().is_busy());
        assert!(manager.lock().try_lock(&resource, &any_card).unwrap().is_some());
    }

    #[test]
    fn test_unlock_ignores_other_resource() {
        let reader = TestReader::with_card("R", &[0x3B, 0x01]);
        let manager = ReaderManager::new(reader.clone(), "P", None);
        let old = manager.lock().try_match_and_register(&any_card).unwrap();

        reader.insert(Some(&[0x3B, 0x02][..]));
        let new = manager.lock().try_match_and_register(&any_card).unwrap();
        assert!(manager.lock().try_lock(&new, &any_card).unwrap().is_some());

        manager.lock().unlock(&old);
        assert!(manager.lock().is_busy());
    }

    #[test]
    fn test_lock_reverifies_unselected_resource() {
        let reader = TestReader::with_card("R", &[0x3B, 0x01]);
        let manager = ReaderManager::new(reader.clone(), "P", None);
        let first = manager.lock().try_match_and_register(&any_card).unwrap();

        reader.insert(Some(&[0x3B, 0x02][..]));
        let second = manager.lock().try_match_and_register(&any_card).unwrap();
        assert_ne!(first, second);

        // The reader now holds the second card
        assert_eq!(
            manager.lock().try_lock(&first, &any_card),
            Err(LockError::CardChanged)
        );

        reader.insert(None);
        assert_eq!(
            manager.lock().try_lock(&second, &any_card),
            Err(LockError::Unusable)
        );

        reader.insert(Some(&[0x3B, 0x01][..]));
        assert!(manager.lock().try_lock(&first, &any_card).unwrap().is_some());
    }

    #[test]
    fn test_usage_timeout_expires_lock() {
        let manager = ReaderManager::new(
            TestReader::with_card("R", &[0x3B]),
            "P",
            Some(Duration::from_millis(20)),
        );
        let resource = manager.lock().try_match_and_register(&any_card).unwrap();

        let stale = manager.lock().try_lock(&resource, &any_card).unwrap().unwrap();
        assert_eq!(manager.lock().try_lock(&resource, &any_card), Ok(None));

        thread::sleep(Duration::from_millis(30));
        let fresh = manager.lock().try_lock(&resource, &any_card).unwrap().unwrap();

        // The reclaimed lease can no longer give the reader back
        manager.lock().unlock(&stale);
        assert!(manager.lock().is_busy());
        manager.lock().unlock(&fresh);
        assert!(!manager.lock().is_busy());
    }

    #[test]
    fn test_unleased_handle_always_unlocks() {
        let manager = ReaderManager::new(TestReader::with_card("R", &[0x3B]), "P", None);
        let resource = manager.lock().try_match_and_register(&any_card).unwrap();
        manager.lock().try_lock(&resource, &any_card).unwrap().unwrap();

        manager.lock().unlock(&resource);
        assert!(!manager.lock().is_busy());
    }

    #[test]
    fn test_match_deferred_while_busy() {
        let manager = ReaderManager::new(TestReader::with_card("R", &[0x3B]), "P", None);
        let resource = manager.lock().try_match_and_register(&any_card).unwrap();
        assert!(manager.lock().try_lock(&resource, &any_card).unwrap().is_some());

        assert!(manager.lock().try_match_and_register(&any_card).is_none());
    }

    #[test]
    fn test_remove_resource_clears_selection() {
        let manager = ReaderManager::new(TestReader::with_card("R", &[0x3B]), "P", None);
        let resource = manager.lock().try_match_and_register(&any_card).unwrap();

        manager.lock().remove_resource(&resource);
        assert!(manager.lock().resources().is_empty());

        // A fresh match creates a new resource
        let again = manager.lock().try_match_and_register(&any_card).unwrap();
        assert_ne!(again, resource);
    }
}
