use std::path::{Path, PathBuf};
use std::sync::Arc;

use fxhash::FxHashMap;
use log::{debug, info};
use serde::Deserialize;

use crate::config::defs::{PipelineError, RunConfig};
use crate::pipelines::manifest::ManifestRow;
use crate::pipelines::platform::ClassificationScope;

/// One row of the reference index collection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub annotation_version: String,
}

/// Reference genomes available at the facility, keyed by genome id.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    entries: FxHashMap<String, Vec<IndexEntry>>,
}

impl ReferenceIndex {
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            PipelineError::InvalidConfig(format!("Cannot open reference index {:?}: {}", path, e))
        })?;
        let index = Self::from_reader(bytes.as_slice())?;
        info!("Loaded {} reference genomes from {:?}", index.entries.len(), path);
        Ok(index)
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self, PipelineError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut entries: FxHashMap<String, Vec<IndexEntry>> = FxHashMap::default();
        for result in rdr.deserialize() {
            let entry: IndexEntry = result.map_err(|e| {
                PipelineError::InvalidConfig(format!("Bad reference index row: {}", e))
            })?;
            entries.entry(entry.id.clone()).or_default().push(entry);
        }
        Ok(ReferenceIndex { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, genome: &str) -> bool {
        self.entries.contains_key(genome)
    }

    /// Distinct annotations for a genome id, optionally restricted to one species.
    /// A species that matches none of the id's entries is ignored.
    pub fn annotations(&self, genome: &str, species: Option<&str>) -> Vec<String> {
        let Some(candidates) = self.entries.get(genome) else {
            return Vec::new();
        };
        let wanted = species.map(normalize_species).filter(|s| !s.is_empty());
        let by_species: Vec<&IndexEntry> = match &wanted {
            Some(sp) => candidates.iter().filter(|e| normalize_species(&e.name) == *sp).collect(),
            None => Vec::new(),
        };
        let pool: Vec<&IndexEntry> = if by_species.is_empty() {
            candidates.iter().collect()
        } else {
            by_species
        };

        let mut annotations: Vec<String> = Vec::new();
        for entry in pool {
            if !annotations.contains(&entry.annotation_version) {
                annotations.push(entry.annotation_version.clone());
            }
        }
        annotations
    }
}

/// `Mus musculus (house mouse)` -> `Mus_musculus`
pub fn normalize_species(species: &str) -> String {
    let underscored = species.trim().replace(' ', "_");
    match underscored.split("_(").next() {
        Some(head) => head.to_string(),
        None => underscored,
    }
}

fn is_missing(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case("NA") || v.eq_ignore_ascii_case("None") || v.eq_ignore_ascii_case("nan")
}


#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceGenome {
    pub genome: String,
    pub annotation: String,
    /// bowtie2 index prefix
    pub bowtie2_index: PathBuf,
    pub cellranger_ref: PathBuf,
}

impl ReferenceGenome {
    pub fn new(index_root: &Path, genome: &str, annotation: &str) -> Self {
        let genome_dir = index_root.join(genome);
        ReferenceGenome {
            genome: genome.to_string(),
            annotation: annotation.to_string(),
            bowtie2_index: genome_dir.join("bowtie2").join(genome),
            cellranger_ref: genome_dir.join("annotation").join(annotation).join("10x").join("cellranger"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    HasReference(ReferenceGenome),
    NoReference { reason: String },
}

impl Classification {
    pub fn has_reference(&self) -> bool {
        matches!(self, Classification::HasReference(_))
    }

    pub fn reference(&self) -> Option<&ReferenceGenome> {
        match self {
            Classification::HasReference(r) => Some(r),
            Classification::NoReference { .. } => None,
        }
    }
}


/// Decides reference availability for one row.
///
/// # Arguments
///
/// * `row` - Manifest row.
/// * `index` - Reference index collection.
/// * `config` - Run context supplying overrides and the index root.
///
/// # Returns
/// Classification. Unknown or ambiguous genomes are NoReference, never an error.
pub fn classify_row(row: &ManifestRow, index: &ReferenceIndex, config: &RunConfig) -> Classification {
    if config.only_cp_fastq {
        return Classification::NoReference { reason: "fastq copy only".to_string() };
    }

    let annotation_hint = config
        .annotation
        .clone()
        .or_else(|| Some(row.annotation.clone()).filter(|a| !is_missing(a)));

    if let Some(genome) = &config.genome {
        let annotation = annotation_hint
            .or_else(|| single(index.annotations(genome, None)))
            .unwrap_or_default();
        return Classification::HasReference(ReferenceGenome::new(&config.index_root, genome, &annotation));
    }

    if is_missing(&row.genome) {
        debug!("Library {}: no genome given", row.library_id);
        return Classification::NoReference { reason: "no genome given".to_string() };
    }

    let species = Some(row.species.as_str()).filter(|s| !is_missing(s));
    let annotations = index.annotations(&row.genome, species);
    let chosen = match (annotations.len(), annotation_hint) {
        (0, _) => None,
        (1, _) => annotations.first().cloned(),
        (_, Some(hint)) if annotations.contains(&hint) => Some(hint),
        _ => {
            debug!(
                "Library {}: genome {} is ambiguous across annotations {:?}",
                row.library_id, row.genome, annotations
            );
            return Classification::NoReference {
                reason: format!("genome {} has {} annotations", row.genome, annotations.len()),
            };
        }
    };

    match chosen {
        Some(annotation) => {
            Classification::HasReference(ReferenceGenome::new(&config.index_root, &row.genome, &annotation))
        }
        None => {
            debug!("Library {}: genome {} not in the reference index", row.library_id, row.genome);
            Classification::NoReference { reason: format!("genome {} not in the reference index", row.genome) }
        }
    }
}

fn single(mut values: Vec<String>) -> Option<String> {
    if values.len() == 1 { values.pop() } else { None }
}

/// Classifies every row, applying the platform's scope.
pub fn classify_rows(
    rows: &[Arc<ManifestRow>],
    index: &ReferenceIndex,
    config: &RunConfig,
    scope: ClassificationScope,
) -> Vec<Classification> {
    let classes: Vec<Classification> = rows.iter().map(|row| classify_row(row, index, config)).collect();

    if scope == ClassificationScope::PerRun {
        if let Some(pos) = classes.iter().position(|c| !c.has_reference()) {
            let reason = format!("library {} has no reference; run processed without references", rows[pos].library_id);
            info!("{}", reason);
            return classes.iter().map(|_| Classification::NoReference { reason: reason.clone() }).collect();
        }
    }
    classes
}
