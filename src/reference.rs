//! Versioned reference tables: taxonomy overrides, class-tier rules and the
//! per-region gate conventions.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::class_tier::{default_class_rules, CategoryFallback, ClassRule, ClassTierRules};
use crate::sectionals::{default_gate_grids, GateGrid, SectionalCheckpointMap, SectionalError};
use crate::taxonomy::{TaxonomyResolver, TrackOverride};

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("failed to read reference tables at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse reference tables at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("class rule {label} has an invalid pattern: {source}")]
    InvalidClassPattern {
        label: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Sectional(#[from] SectionalError),
    #[error("failed to encode reference tables: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTables {
    pub version: String,
    #[serde(default)]
    pub track_overrides: Vec<TrackOverride>,
    #[serde(default = "default_class_rules")]
    pub class_rules: Vec<ClassRule>,
    #[serde(default)]
    pub class_fallback: CategoryFallback,
    #[serde(default = "default_gate_grids")]
    pub gate_grids: Vec<GateGrid>,
}

impl Default for ReferenceTables {
    fn default() -> Self {
        Self {
            version: "builtin".to_string(),
            track_overrides: Vec::new(),
            class_rules: default_class_rules(),
            class_fallback: CategoryFallback::default(),
            gate_grids: default_gate_grids(),
        }
    }
}

impl ReferenceTables {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// SHA-256 over the canonical JSON encoding. Two tables with the same
    /// content always share a fingerprint, whatever file they came from.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn compile(&self) -> Result<CompiledReference, ReferenceError> {
        Ok(CompiledReference {
            version: self.version.clone(),
            fingerprint: self.fingerprint().map_err(ReferenceError::Encode)?,
            taxonomy: TaxonomyResolver::with_overrides(&self.track_overrides),
            class_rules: ClassTierRules::compile(&self.class_rules, self.class_fallback)?,
            checkpoints: SectionalCheckpointMap::build(&self.gate_grids)?,
        })
    }
}

pub fn load_reference_tables(path: &Path) -> Result<ReferenceTables, ReferenceError> {
    let raw = fs::read_to_string(path).map_err(|source| ReferenceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ReferenceTables::from_json(&raw).map_err(|source| ReferenceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the tables at `path`, or the built-in set when no path is given.
pub fn resolve_reference(path: Option<&Path>) -> Result<CompiledReference, ReferenceError> {
    let tables = match path {
        Some(path) => load_reference_tables(path)?,
        None => ReferenceTables::default(),
    };
    let compiled = tables.compile()?;
    tracing::info!(
        component = "reference",
        event = "reference.loaded",
        version = %compiled.version,
        fingerprint = %compiled.fingerprint,
        class_rules = compiled.class_rules.len(),
        checkpoint_buckets = compiled.checkpoints.len(),
        source = path.map(|p| p.display().to_string()).unwrap_or_else(|| "builtin".to_string())
    );
    Ok(compiled)
}

#[derive(Debug, Clone)]
pub struct CompiledReference {
    pub version: String,
    pub fingerprint: String,
    pub taxonomy: TaxonomyResolver,
    pub class_rules: ClassTierRules,
    pub checkpoints: SectionalCheckpointMap,
}

impl CompiledReference {
    pub fn builtin() -> Result<Self, ReferenceError> {
        ReferenceTables::default().compile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::taxonomy::Surface;

    #[test]
    fn partial_json_fills_defaults() {
        let tables = ReferenceTables::from_json(
            r#"{
                "version": "2024-06",
                "track_overrides": [{"track": "Meydan", "surface": "Dirt"}]
            }"#,
        )
        .expect("valid json");

        assert_eq!(tables.class_rules, default_class_rules());
        assert_eq!(tables.gate_grids, default_gate_grids());

        let compiled = tables.compile().expect("tables compile");
        assert_eq!(compiled.taxonomy.resolve("Meydan", None).surface, Surface::Dirt);
        assert_eq!(compiled.version, "2024-06");
    }

    #[test]
    fn fingerprint_tracks_content_not_formatting() {
        let compact = ReferenceTables::from_json(r#"{"version":"v1"}"#).expect("valid");
        let spaced = ReferenceTables::from_json("{\n  \"version\" : \"v1\"\n}").expect("valid");
        let fingerprint = compact.fingerprint().expect("tables encode");
        assert_eq!(spaced.fingerprint().expect("tables encode"), fingerprint);
        assert_eq!(fingerprint.len(), 64);

        let mut changed = compact.clone();
        changed.class_fallback.metro = 50;
        assert_ne!(changed.fingerprint().expect("tables encode"), fingerprint);
    }

    #[test]
    fn loads_from_file_and_reports_bad_json() {
        let mut good = NamedTempFile::new().expect("temp file");
        write!(
            good,
            r#"{{"version":"file","gate_grids":[{{"region":"HK","convention":{{"kind":"to_finish","interval_m":200}},"min_distance_m":1000,"max_distance_m":2400}}]}}"#
        )
        .expect("write");
        let tables = load_reference_tables(good.path()).expect("loads");
        assert_eq!(tables.gate_grids.len(), 1);

        let mut bad = NamedTempFile::new().expect("temp file");
        write!(bad, "{{not json").expect("write");
        let err = load_reference_tables(bad.path()).expect_err("parse failure");
        assert!(matches!(err, ReferenceError::Parse { .. }));
    }

    #[test]
    fn invalid_grid_surfaces_as_reference_error() {
        let mut tables = ReferenceTables::default();
        tables.gate_grids.push(tables.gate_grids[0].clone());
        let err = tables.compile().expect_err("duplicate region");
        assert!(matches!(err, ReferenceError::Sectional(SectionalError::DuplicateRegion(_))));
    }
}
