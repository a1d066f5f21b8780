use thiserror::Error;

/// Core error type for configuration and environment setup.
///
/// Package-manager failures use [`crate::pkg::PkgError`] instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid registry URL '{url}': {source}")]
    RegistryUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}
