//! On-disk fuel map storage
//!
//! One JSON file per (profile, cylinder): `fuel_map_<profile>_cylinder_<n>.json`.
//! Saves go to a sibling temp file which is synced and then renamed over the
//! target, so a failed write never leaves a truncated map behind.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{FuelMap, PersistenceError, Profile};

#[derive(Serialize)]
struct StoredFuelMapRef<'a> {
    #[serde(flatten)]
    map: &'a FuelMap,
    modified: String,
}

#[derive(Deserialize)]
struct StoredFuelMap {
    #[serde(flatten)]
    map: FuelMap,
    #[allow(dead_code)]
    #[serde(default)]
    modified: Option<String>,
}

/// Directory of persisted fuel maps
#[derive(Debug, Clone)]
pub struct FuelMapStore {
    dir: PathBuf,
}

impl FuelMapStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing the map for `profile` / `cylinder`
    pub fn path_for(&self, profile: Profile, cylinder: u8) -> PathBuf {
        self.dir
            .join(format!("fuel_map_{}_cylinder_{}.json", profile.name(), cylinder))
    }

    /// Load a persisted map
    pub fn load(&self, profile: Profile, cylinder: u8) -> Result<FuelMap, PersistenceError> {
        let path = self.path_for(profile, cylinder);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(path));
            }
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };

        serde_json::from_str::<StoredFuelMap>(&content)
            .map(|stored| stored.map)
            .map_err(|source| PersistenceError::Json { path, source })
    }

    /// Atomically replace the persisted map
    pub fn save(&self, map: &FuelMap, profile: Profile, cylinder: u8) -> Result<(), PersistenceError> {
        let path = self.path_for(profile, cylinder);

        let stored = StoredFuelMapRef {
            map,
            modified: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&stored).map_err(|source| PersistenceError::Json {
            path: path.clone(),
            source,
        })?;

        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        let written = write_synced(&tmp, json.as_bytes()).and_then(|()| fs::rename(&tmp, &path));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(PersistenceError::Io { path, source });
        }

        tracing::debug!(profile = %profile, cylinder, "fuel map saved");
        Ok(())
    }

    /// Load the persisted map, or create and persist the seeded default
    pub fn load_or_create(&self, profile: Profile, cylinder: u8, resolution: usize) -> FuelMap {
        match self.load(profile, cylinder) {
            Ok(map) => map,
            Err(PersistenceError::NotFound(_)) => {
                let map = FuelMap::seeded(cylinder, resolution);
                if let Err(e) = self.save(&map, profile, cylinder) {
                    tracing::warn!("could not persist default fuel map: {e}");
                }
                tracing::info!(profile = %profile, cylinder, resolution, "created default fuel map");
                map
            }
            Err(e) => {
                tracing::warn!(profile = %profile, cylinder, "ignoring unreadable fuel map: {e}");
                FuelMap::seeded(cylinder, resolution)
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
