//! Prints the effective engine config and registry as JSON.
//!
//! The stored credential is never printed; only whether one is set.

use applock_core::{
    load_engine_config_or_default, AppLockError, EngineConfig, RegistryData, Result,
    StorageConfig,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct EffectiveConfig {
    pub storage_root: PathBuf,
    pub engine: EngineConfig,
    pub registry: RegistryData,
    pub credential_set: bool,
}

pub fn collect(storage: &StorageConfig) -> Result<EffectiveConfig> {
    let engine = load_engine_config_or_default(&storage.engine_config_file());
    let mut registry = RegistryData::load(&storage.registry_file())?;
    let credential_set = registry.credential.take().is_some();

    Ok(EffectiveConfig {
        storage_root: storage.root().to_path_buf(),
        engine,
        registry,
        credential_set,
    })
}

pub fn run<W: Write>(storage: &StorageConfig, mut out: W) -> Result<()> {
    let effective = collect(storage)?;
    serde_json::to_writer_pretty(&mut out, &effective).map_err(|source| AppLockError::Json {
        context: "encoding effective config".to_string(),
        source,
    })?;
    writeln!(out).map_err(|source| AppLockError::Io {
        context: "writing effective config".to_string(),
        source,
    })
}
