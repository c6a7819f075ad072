//! Map lifecycle glue.
//!
//! The core only needs a map's identity (name + checksum) and its entity
//! list. Loading is delegated to a [`MapLoader`]; geometry stays with whatever
//! loader implementation produced it.

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    bsp::{self, BspEntity},
    codec::MAX_MAP_NAME_LEN,
    error::MapError,
    math::Vec3,
    net::{MapChecksum, MapInfo},
};

/// A map as seen by the network core.
#[derive(Debug, Clone)]
pub struct LoadedMap {
    pub info: MapInfo,
    pub entities: Vec<BspEntity>,
}

impl LoadedMap {
    /// Origins of every `info_player_*` entity, in lump order.
    pub fn spawn_points(&self) -> Vec<(Vec3, Vec3)> {
        self.entities
            .iter()
            .filter(|e| e.is_spawn_point())
            .filter_map(|e| Some((e.origin()?, e.angles().unwrap_or_default())))
            .collect()
    }
}

/// Resolves a map name to its content. Must be deterministic: loading the
/// same name twice yields the same checksum.
pub trait MapLoader: Send {
    fn load(&self, name: &str) -> Result<LoadedMap, MapError>;
}

/// Rejects names that could escape the maps directory or not fit on the wire.
pub fn validate_map_name(name: &str) -> Result<(), MapError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_MAP_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(MapError::InvalidName(name.to_string()))
    }
}

/// Loads `<maps_dir>/<name>.bsp` and checksums the whole file.
#[derive(Debug, Clone)]
pub struct BspMapLoader {
    maps_dir: PathBuf,
}

impl BspMapLoader {
    pub fn new(maps_dir: impl Into<PathBuf>) -> Self {
        Self {
            maps_dir: maps_dir.into(),
        }
    }

    pub fn maps_dir(&self) -> &Path {
        &self.maps_dir
    }
}

impl MapLoader for BspMapLoader {
    fn load(&self, name: &str) -> Result<LoadedMap, MapError> {
        validate_map_name(name)?;
        let path = self.maps_dir.join(format!("{name}.bsp"));
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MapError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let entities = bsp::read_entities(&data).map_err(|e| MapError::Corrupt {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })?;
        debug!(map = %name, path = %path.display(), entities = entities.len(), "read bsp");
        Ok(LoadedMap {
            info: MapInfo {
                name: name.to_string(),
                checksum: MapChecksum::of(&data),
            },
            entities,
        })
    }
}

/// In-memory maps keyed by name. Content is entity lump text; the checksum
/// covers that text.
#[derive(Debug, Clone, Default)]
pub struct MemoryMapLoader {
    maps: HashMap<String, String>,
}

impl MemoryMapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(mut self, name: &str, entity_lump: &str) -> Self {
        self.insert(name, entity_lump);
        self
    }

    pub fn insert(&mut self, name: &str, entity_lump: &str) {
        self.maps.insert(name.to_string(), entity_lump.to_string());
    }
}

impl MapLoader for MemoryMapLoader {
    fn load(&self, name: &str) -> Result<LoadedMap, MapError> {
        validate_map_name(name)?;
        let text = self
            .maps
            .get(name)
            .ok_or_else(|| MapError::NotFound(name.to_string()))?;
        let entities = bsp::parse_entity_lump(text).map_err(|e| MapError::Corrupt {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })?;
        Ok(LoadedMap {
            info: MapInfo {
                name: name.to_string(),
                checksum: MapChecksum::of(text.as_bytes()),
            },
            entities,
        })
    }
}
