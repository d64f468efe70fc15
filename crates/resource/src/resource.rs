//! Card resource: a reader paired with an identified card

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::card::IdentifiedCard;
use crate::plugin::Reader;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    reader: Arc<dyn Reader>,
    card: IdentifiedCard,
}

/// The unit of allocation: one reader holding one identified card.
///
/// Cloning is cheap. Two handles are equal only when they come from the same
/// creation, even if another resource holds an equivalent card. Handles
/// returned by an allocation also carry the lease they were granted under,
/// which equality ignores.
#[derive(Clone)]
pub struct CardResource {
    inner: Arc<Inner>,
    /// Reader lease this handle was handed out under, 0 for none
    lease: u64,
}

impl CardResource {
    pub(crate) fn new(reader: Arc<dyn Reader>, card: IdentifiedCard) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                reader,
                card,
            }),
            lease: 0,
        }
    }

    /// The same resource, stamped with a reader lease
    pub(crate) fn with_lease(&self, lease: u64) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lease,
        }
    }

    pub(crate) fn lease(&self) -> u64 {
        self.lease
    }

    /// Process-unique identifier of this resource
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The reader holding the card
    pub fn reader(&self) -> &Arc<dyn Reader> {
        &self.inner.reader
    }

    /// Name of the reader holding the card
    pub fn reader_name(&self) -> &str {
        self.inner.reader.name()
    }

    /// The identified card
    pub fn card(&self) -> &IdentifiedCard {
        &self.inner.card
    }
}

impl PartialEq for CardResource {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for CardResource {}

impl Hash for CardResource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for CardResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardResource")
            .field("id", &self.inner.id)
            .field("reader", &self.reader_name())
            .field("card", &self.inner.card)
            .finish()
    }
}

impl fmt::Display for CardResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "card resource #{} - reader '{}' - card ({})",
            self.inner.id,
            self.reader_name(),
            self.inner.card
        )
    }
}
