//! Identified card data

use std::fmt;

use bytes::Bytes;

/// Minimal data captured about a card after a successful profile match
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdentifiedCard {
    /// Power-on data (ATR) of the card
    power_on_data: Bytes,
    /// Response to the application selection (FCI), if one was performed
    selection_response: Option<Bytes>,
}

impl IdentifiedCard {
    /// Create a card identified by its power-on data only
    pub fn new(power_on_data: impl Into<Bytes>) -> Self {
        Self {
            power_on_data: power_on_data.into(),
            selection_response: None,
        }
    }

    /// Attach the application selection response
    pub fn with_selection_response(mut self, selection_response: impl Into<Bytes>) -> Self {
        self.selection_response = Some(selection_response.into());
        self
    }

    /// Get the power-on data
    pub fn power_on_data(&self) -> &[u8] {
        &self.power_on_data
    }

    /// Get the application selection response, if any
    pub fn selection_response(&self) -> Option<&[u8]> {
        self.selection_response.as_deref()
    }

    /// Whether both cards carry byte-for-byte identical power-on data and
    /// selection responses.
    pub fn same_card(&self, other: &Self) -> bool {
        self == other
    }
}

impl fmt::Debug for IdentifiedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifiedCard")
            .field("power_on_data", &hex::encode(&self.power_on_data))
            .field(
                "selection_response",
                &self.selection_response.as_ref().map(hex::encode),
            )
            .finish()
    }
}

impl fmt::Display for IdentifiedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atr={}", hex::encode(&self.power_on_data))?;
        if let Some(fci) = &self.selection_response {
            write!(f, " fci={}", hex::encode(fci))?;
        }
        Ok(())
    }
}

/// Match an ATR against a pattern with an optional mask
///
/// If a mask is provided, only the bits set in the mask are compared.
pub(crate) fn match_atr(atr: &[u8], pattern: &[u8], mask: Option<&[u8]>) -> bool {
    if pattern.len() > atr.len() {
        return false;
    }

    match mask {
        Some(mask) => {
            // Mask must be at least as long as pattern
            if mask.len() < pattern.len() {
                return false;
            }
            atr.iter()
                .zip(pattern)
                .zip(mask)
                .all(|((a, p), m)| (a & m) == (p & m))
        }
        None => atr.starts_with(pattern),
    }
}
