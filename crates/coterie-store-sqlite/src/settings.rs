//! Store configuration, layered from an optional TOML file and `COTERIE_*`
//! environment variables.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
  /// Database file. `None` opens an in-memory store.
  pub path:            Option<PathBuf>,
  /// How long a writer waits on a locked database.
  pub busy_timeout_ms: u64,
}

impl Default for StoreSettings {
  fn default() -> Self { Self { path: None, busy_timeout_ms: 5_000 } }
}

impl StoreSettings {
  /// Read `file` (if given and present), then apply `COTERIE_PATH` and
  /// `COTERIE_BUSY_TIMEOUT_MS` on top.
  pub fn load(file: Option<&Path>) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(file) = file {
      builder = builder.add_source(config::File::from(file).required(false));
    }
    let settings = builder
      .add_source(config::Environment::with_prefix("COTERIE"))
      .build()?
      .try_deserialize()?;
    Ok(settings)
  }

  pub fn from_toml(text: &str) -> Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from_str(text, config::FileFormat::Toml))
      .build()?
      .try_deserialize()?;
    Ok(settings)
  }

  pub fn busy_timeout(&self) -> Duration {
    Duration::from_millis(self.busy_timeout_ms)
  }
}
