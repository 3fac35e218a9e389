//! Layered configuration loading for the harness.
#![deny(warnings)]
#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Json},
    Figment,
};
use serde::de::DeserializeOwned;
use snafu::Snafu;
use tracing::debug;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A required configuration file does not exist.
    #[snafu(display("Configuration file '{}' does not exist.", path.display()))]
    MissingFile {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration.", field))]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// Requested field's data type was not the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field.
        ///
        /// This is a period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration: {}", source))]
    Generic {
        /// Error source.
        source: Box<figment::Error>,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            Kind::MissingField(field) => Self::MissingField {
                field: if e.path.is_empty() {
                    field.into_owned()
                } else {
                    format!("{}.{}", e.path.join("."), field)
                },
            },
            _ => Self::Generic { source: Box::new(e) },
        }
    }
}

/// A configuration loader that can pull from various sources.
///
/// Sources are layered in the order they are added: sources added later take precedence over sources added earlier.
/// Anything not provided by any source falls back to the `Default` of the type being extracted, so typed
/// configuration structs are expected to use `#[serde(default)]`.
///
/// # Supported sources
///
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    figment: Figment,
}

impl ConfigurationLoader {
    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file does not exist, an error will be returned. Invalid JSON is reported when the configuration is
    /// extracted.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::MissingFile {
                path: path.to_path_buf(),
            });
        }

        self.figment = self.figment.merge(Json::file(path));
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring it if it does not exist.
    pub fn try_from_json<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if path.is_file() {
            self.figment = self.figment.merge(Json::file(path));
        } else {
            debug!(file_path = %path.display(), "JSON configuration file not found. Ignoring.");
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `app`, any environment variable starting with `app_` would be matched, and `APP_LOG_LEVEL` would set
    /// the `log_level` field.
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() || prefix == "_" {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        self.figment = self.figment.merge(Env::prefixed(&prefix));
        Ok(self)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<T>(self) -> Result<T, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        self.figment.extract().map_err(Into::into)
    }
}
