//! The persistent build database.
//!
//! One JSON file per project, holding for every node the digest of its
//! last expanded recipe, the observed state of its outputs, and the
//! content hashes of its prerequisites at the last successful build.
//! Collisions in the 64-bit hash cause an overbuild, never an
//! underbuild, since the executor also checks file state directly.

use std::collections::HashMap;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use fnv::FnvHasher;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::rules::SourceLoc;

/// 64-bit FNV-1a over a string.
pub fn hash_str(s: &str) -> u64 {
    let mut h = FnvHasher::default();
    h.write(s.as_bytes());
    h.finish()
}

/// 64-bit FNV-1a over a file's bytes.
pub fn hash_file(path: &Path) -> std::io::Result<u64> {
    let bytes = fs::read(path)?;
    let mut h = FnvHasher::default();
    h.write(&bytes);
    Ok(h.finish())
}

/// Hash a set of files in parallel, preserving input order.
pub fn hash_files(paths: &[String]) -> Vec<(String, std::io::Result<u64>)> {
    paths
        .par_iter()
        .map(|p| (p.clone(), hash_file(Path::new(p))))
        .collect()
}

/// Stable node identifier: a digest over the sorted target list, the
/// declaring rule's source line, and the working directory.
pub fn node_id(targets: &[String], loc: &SourceLoc, workdir: &str) -> u64 {
    let mut sorted: Vec<&str> = targets.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut h = FnvHasher::default();
    for t in sorted {
        h.write(t.as_bytes());
        h.write_u8(0);
    }
    h.write_u64(hash_str(&loc.to_string()));
    h.write(workdir.as_bytes());
    h.finish()
}

/// State of one output file as observed right after a successful
/// recipe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputState {
    pub path: String,
    pub mtime: Option<SystemTime>,
    pub size: u64,
    pub hash: u64,
}

/// A prerequisite path and its content hash at the last successful
/// build. Includes dep-file-discovered prerequisites.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PrereqState {
    pub path: String,
    pub hash: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NodeRecord {
    pub recipe_digest: u64,
    pub outputs: Vec<OutputState>,
    pub prereqs: Vec<PrereqState>,
}

impl NodeRecord {
    /// True for the record returned when a node has never been built.
    pub fn is_empty(&self) -> bool {
        self.recipe_digest == 0 && self.outputs.is_empty() && self.prereqs.is_empty()
    }

    pub fn output(&self, path: &str) -> Option<&OutputState> {
        self.outputs.iter().find(|o| o.path == path)
    }

    pub fn prereq_hash(&self, path: &str) -> Option<u64> {
        self.prereqs.iter().find(|p| p.path == path).map(|p| p.hash)
    }
}

/// Where the database lives: `.knit` under the project root, or a user
/// cache directory keyed by the absolute project path.
pub fn cache_dir(project_root: &Path, cache_override: Option<&Path>) -> PathBuf {
    match cache_override {
        Some(dir) => {
            let abs = project_root
                .canonicalize()
                .unwrap_or_else(|_| project_root.to_path_buf());
            dir.join(format!("{:016x}", hash_str(&abs.to_string_lossy())))
        }
        None => project_root.join(".knit"),
    }
}

#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    records: Mutex<HashMap<String, NodeRecord>>,
}

impl Db {
    /// Open (or initialize) the database in `dir`. An unreadable or
    /// corrupt file starts an empty database rather than failing the
    /// build; the worst case is an overbuild.
    pub fn open(dir: &Path) -> Result<Db> {
        fs::create_dir_all(dir)?;
        let path = dir.join("db.json");
        let records = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!("discarding unreadable build database {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(records = records.len(), "opened build database {}", path.display());
        Ok(Db {
            path,
            records: Mutex::new(records),
        })
    }

    /// Fetch the record for a node. Missing keys yield an empty record.
    pub fn lookup(&self, id: u64) -> NodeRecord {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&key(id)).cloned().unwrap_or_default()
    }

    pub fn record(&self, id: u64, rec: NodeRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(key(id), rec);
    }

    /// Persist atomically: serialize to a sibling temp file, then
    /// rename over the previous database.
    pub fn save(&self) -> Result<()> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let json = serde_json::to_string(&*records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(records = records.len(), "saved build database");
        Ok(())
    }
}

fn key(id: u64) -> String {
    format!("{:016x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loc(line: usize) -> SourceLoc {
        SourceLoc {
            file: "knitfile".to_string(),
            line,
        }
    }

    #[test]
    fn test_lookup_missing_returns_empty_record() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path()).unwrap();
        let rec = db.lookup(42);
        assert!(rec.is_empty());
    }

    #[test]
    fn test_record_survives_save_and_reopen() {
        let dir = TempDir::new().unwrap();
        let rec = NodeRecord {
            recipe_digest: hash_str("cc -c hello.c"),
            outputs: vec![OutputState {
                path: "hello.o".to_string(),
                mtime: Some(SystemTime::now()),
                size: 128,
                hash: 7,
            }],
            prereqs: vec![PrereqState {
                path: "hello.c".to_string(),
                hash: 9,
            }],
        };
        {
            let db = Db::open(dir.path()).unwrap();
            db.record(1, rec.clone());
            db.save().unwrap();
        }
        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.lookup(1), rec);
    }

    #[test]
    fn test_corrupt_database_starts_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("db.json"), "not json").unwrap();
        let db = Db::open(dir.path()).unwrap();
        assert!(db.lookup(1).is_empty());
    }

    #[test]
    fn test_node_id_ignores_target_order() {
        let a = node_id(
            &["x".to_string(), "y".to_string()],
            &loc(3),
            "/proj",
        );
        let b = node_id(
            &["y".to_string(), "x".to_string()],
            &loc(3),
            "/proj",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_node_id_distinguishes_rule_line_and_workdir() {
        let targets = vec!["x".to_string()];
        let base = node_id(&targets, &loc(3), "/proj");
        assert_ne!(base, node_id(&targets, &loc(4), "/proj"));
        assert_ne!(base, node_id(&targets, &loc(3), "/other"));
    }

    #[test]
    fn test_hash_file_matches_hash_str() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "contents").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_str("contents"));
    }

    #[test]
    fn test_hash_files_reports_missing() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("a");
        fs::write(&present, "a").unwrap();
        let paths = vec![
            present.to_string_lossy().to_string(),
            dir.path().join("missing").to_string_lossy().to_string(),
        ];
        let hashed = hash_files(&paths);
        assert!(hashed[0].1.is_ok());
        assert!(hashed[1].1.is_err());
    }

    #[test]
    fn test_cache_dir_default_and_keyed() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cache_dir(dir.path(), None), dir.path().join(".knit"));
        let user = dir.path().join("cache");
        let keyed = cache_dir(dir.path(), Some(&user));
        assert!(keyed.starts_with(&user));
        // Same project always maps to the same keyed directory.
        assert_eq!(keyed, cache_dir(dir.path(), Some(&user)));
    }
}
