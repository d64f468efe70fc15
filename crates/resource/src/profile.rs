//! Card resource profiles

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::card::{IdentifiedCard, match_atr};
use crate::plugin::Reader;

/// Predicate deciding whether the card inserted in a reader fits a profile.
///
/// Implementations may exchange APDUs with the card, so the service only calls
/// `matches` while it holds exclusive possession of the reader.
pub trait CardResourceProfileExtension: Send + Sync {
    /// Identify the inserted card, or return `None` if it does not fit
    fn matches(&self, reader: &dyn Reader) -> Option<IdentifiedCard>;
}

impl<F> CardResourceProfileExtension for F
where
    F: Fn(&dyn Reader) -> Option<IdentifiedCard> + Send + Sync,
{
    fn matches(&self, reader: &dyn Reader) -> Option<IdentifiedCard> {
        self(reader)
    }
}

/// Profile extension accepting cards whose ATR matches a pattern
#[derive(Debug, Clone)]
pub struct AtrProfileExtension {
    /// Expected ATR prefix
    pattern: Vec<u8>,
    /// Bits of the pattern to compare
    mask: Option<Vec<u8>>,
}

impl AtrProfileExtension {
    /// Accept cards whose ATR starts with `pattern`
    pub const fn new(pattern: Vec<u8>) -> Self {
        Self {
            pattern,
            mask: None,
        }
    }

    /// Only compare the bits set in `mask`
    pub fn with_mask(mut self, mask: Vec<u8>) -> Self {
        self.mask = Some(mask);
        self
    }
}

impl CardResourceProfileExtension for AtrProfileExtension {
    fn matches(&self, reader: &dyn Reader) -> Option<IdentifiedCard> {
        let atr = reader.power_on_data()?;
        match_atr(&atr, &self.pattern, self.mask.as_deref()).then(|| IdentifiedCard::new(atr))
    }
}

/// A named description of what a usable card resource looks like
#[derive(Clone)]
pub struct CardProfile {
    /// Unique profile name
    name: String,
    /// Card matching predicate
    extension: Arc<dyn CardResourceProfileExtension>,
    /// Explicit plugin scope; empty means every configured plugin
    plugins: Vec<String>,
    /// Filter on reader names
    reader_name_regex: Option<String>,
    /// Compiled filter, set when the configuration is built
    reader_name_filter: Option<Regex>,
    /// Group reference used with pool plugins
    reader_group_reference: Option<String>,
}

impl CardProfile {
    /// Create a profile matching cards with the given extension
    pub fn new<S, E>(name: S, extension: E) -> Self
    where
        S: Into<String>,
        E: CardResourceProfileExtension + 'static,
    {
        Self {
            name: name.into(),
            extension: Arc::new(extension),
            plugins: Vec::new(),
            reader_name_regex: None,
            reader_name_filter: None,
            reader_group_reference: None,
        }
    }

    /// Restrict the profile to the named plugins
    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    /// Only accept readers whose whole name matches `regex`
    pub fn with_reader_name_regex<S: Into<String>>(mut self, regex: S) -> Self {
        self.reader_name_regex = Some(regex.into());
        self
    }

    /// Group reference passed to pool plugins
    pub fn with_reader_group_reference<S: Into<String>>(mut self, group_reference: S) -> Self {
        self.reader_group_reference = Some(group_reference.into());
        self
    }

    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicit plugin scope
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Reader name filter, as provided
    pub fn reader_name_regex(&self) -> Option<&str> {
        self.reader_name_regex.as_deref()
    }

    /// Pool group reference
    pub fn reader_group_reference(&self) -> Option<&str> {
        self.reader_group_reference.as_deref()
    }

    pub(crate) fn extension(&self) -> &dyn CardResourceProfileExtension {
        self.extension.as_ref()
    }

    /// Compile the reader name filter as a whole-name match
    pub(crate) fn compile_reader_name_filter(&mut self) -> Result<(), regex::Error> {
        self.reader_name_filter = self
            .reader_name_regex
            .as_deref()
            .map(|regex| Regex::new(&format!("^(?:{regex})$")))
            .transpose()?;
        Ok(())
    }

    pub(crate) fn accepts_reader(&self, reader_name: &str) -> bool {
        self.reader_name_filter
            .as_ref()
            .is_none_or(|filter| filter.is_match(reader_name))
    }
}

impl fmt::Debug for CardProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardProfile")
            .field("name", &self.name)
            .field("plugins", &self.plugins)
            .field("reader_name_regex", &self.reader_name_regex)
            .field("reader_group_reference", &self.reader_group_reference)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_name_filter_matches_whole_name() {
        let mut profile = CardProfile::new("p", AtrProfileExtension::new(vec![0x3B]))
            .with_reader_name_regex("Y.*");
        profile.compile_reader_name_filter().unwrap();

        assert!(profile.accepts_reader("Y1"));
        assert!(!profile.accepts_reader("X"));
        assert!(!profile.accepts_reader("XY"));
    }

    #[test]
    fn test_no_filter_accepts_all() {
        let profile = CardProfile::new("p", AtrProfileExtension::new(vec![0x3B]));
        assert!(profile.accepts_reader("anything"));
    }

    #[test]
    fn test_invalid_regex() {
        let mut profile =
            CardProfile::new("p", AtrProfileExtension::new(vec![0x3B])).with_reader_name_regex("(");
        assert!(profile.compile_reader_name_filter().is_err());
    }
}
