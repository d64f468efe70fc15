//! Error types for the card resource service

/// Result type for card resource operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned by the public service API
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The service has never been configured
    #[error("The card resource service is not configured")]
    NotConfigured,

    /// The service is not started
    #[error("The card resource service is not started")]
    NotStarted,

    /// No profile with this name is configured
    #[error("Unknown card resource profile: {0}")]
    UnknownProfile(String),

    /// The configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A plugin failed while the service was starting
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Configuration validation errors, reported by
/// [`CardResourceServiceConfigBuilder::build`](crate::CardResourceServiceConfigBuilder::build)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Neither a regular nor a pool plugin was added
    #[error("No plugin has been added")]
    NoPlugin,

    /// No card resource profile was added
    #[error("No card resource profile has been added")]
    NoProfile,

    /// Two profiles share the same name
    #[error("Profile already in use: {0}")]
    DuplicateProfile(String),

    /// Two plugins share the same name
    #[error("Plugin already configured: {0}")]
    DuplicatePlugin(String),

    /// A mandatory name is empty
    #[error("Empty {0}")]
    EmptyName(&'static str),

    /// A profile scope references a plugin missing from the global configuration
    #[error("Plugin '{plugin}' referenced by profile '{profile}' is not configured")]
    PluginNotConfigured {
        /// Profile name
        profile: String,
        /// Plugin name
        plugin: String,
    },

    /// The reader name filter of a profile does not compile
    #[error("Invalid reader name regex '{regex}' for profile '{profile}': {source}")]
    InvalidReaderNameRegex {
        /// Profile name
        profile: String,
        /// Regex as provided
        regex: String,
        /// Compilation error
        source: regex::Error,
    },

    /// A numeric parameter is out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Errors raised by plugins and readers
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Source-specific I/O failure
    #[error("Plugin '{plugin}' I/O error: {message}")]
    Io {
        /// Plugin name
        plugin: String,
        /// Failure description
        message: String,
    },

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Operation not supported by this plugin or reader
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// PC/SC error
    #[cfg(feature = "pcsc")]
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),
}

impl PluginError {
    /// Create a new I/O error for the given plugin
    pub fn io<P: Into<String>, M: Into<String>>(plugin: P, message: M) -> Self {
        Self::Io {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Failure to lock a reader on behalf of a known card resource.
///
/// Never surfaced to callers: the allocation search evicts the resource and
/// moves on to the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum LockError {
    /// No card is inserted, or the inserted card no longer matches the profile
    #[error("No card is inserted or it no longer matches the profile")]
    Unusable,

    /// A matching card is inserted but it is not the one the resource was built on
    #[error("The inserted card differs from the one associated with the resource")]
    CardChanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: Error = ConfigError::DuplicateProfile("transit".into()).into();
        assert!(matches!(err, Error::Config(ConfigError::DuplicateProfile(_))));
        assert_eq!(err.to_string(), "Profile already in use: transit");
    }

    #[test]
    fn test_plugin_io_display() {
        let err = PluginError::io("pool", "socket closed");
        assert_eq!(err.to_string(), "Plugin 'pool' I/O error: socket closed");
    }
}
