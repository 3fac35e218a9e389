use std::{
    fs::File,
    io::{BufReader, BufWriter, Write as _},
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::ResultExt as _;

use crate::error::{DecodeConfig, EncodeConfig, InstanceError, ReadConfig, WriteConfig};

/// Configuration handed to the service through its configuration file.
///
/// This is an arbitrary JSON object. It is written once, before the service is spawned, and never changes afterwards.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ServiceConfig(Map<String, Value>);

impl ServiceConfig {
    /// Creates an empty `ServiceConfig`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the updated configuration.
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.insert(key, value);
        self
    }

    /// Sets `key` to `value`, returning the previous value, if any.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<Value>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.0.insert(key.into(), value.into())
    }

    /// Returns the value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns `true` if no keys are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the configuration as a JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Reads a configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or does not contain a JSON object, an error is returned.
    pub fn read_from(path: &Path) -> Result<Self, InstanceError> {
        let file = File::open(path).context(ReadConfig { path })?;
        serde_json::from_reader(BufReader::new(file)).context(DecodeConfig { path })
    }

    /// Writes the configuration to `path`, replacing any existing file.
    ///
    /// The file is flushed and synced before returning, so a process spawned afterwards always observes the complete
    /// configuration.
    pub(crate) fn write_to(&self, path: &Path) -> Result<(), InstanceError> {
        let file = File::create(path).context(WriteConfig { path })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.0).context(EncodeConfig)?;
        writer.flush().context(WriteConfig { path })?;

        let file = writer.into_inner().map_err(|e| e.into_error()).context(WriteConfig { path })?;
        file.sync_all().context(WriteConfig { path })
    }
}

impl From<Map<String, Value>> for ServiceConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for ServiceConfig {
    type Error = Value;

    /// Converts a JSON object into a configuration, handing back any other kind of value unchanged.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}
