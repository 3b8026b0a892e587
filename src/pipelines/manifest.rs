use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::config::defs::PipelineError;

/// Fields of a driver record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestField {
    FastqLocation,
    Genome,
    Species,
    ResultPath,
    OrderId,
    FileName,
    Annotation,
    LibraryId,
    OrderType,
    PiName,
    Requester,
}

impl ManifestField {
    pub fn required(&self) -> bool {
        matches!(
            self,
            ManifestField::FastqLocation
                | ManifestField::Genome
                | ManifestField::ResultPath
                | ManifestField::OrderId
                | ManifestField::FileName
                | ManifestField::LibraryId
        )
    }
}

/// Declared `{field -> source column}` table for one manifest producer.
#[derive(Debug)]
pub struct ColumnMapping {
    pub producer: &'static str,
    pub columns: &'static [(ManifestField, &'static str)],
}

impl ColumnMapping {
    pub fn source_column(&self, field: ManifestField) -> Option<&'static str> {
        self.columns.iter().find(|(f, _)| *f == field).map(|(_, c)| *c)
    }

    /// Producers without a fastq column leave every row's fastqs in the run's fastq source.
    pub fn has_fastq_location(&self) -> bool {
        self.source_column(ManifestField::FastqLocation).is_some()
    }
}

/// Driver CSV written by the facility manifest builders (standard flow cells, NextSeq 2000).
pub static GENERIC_COLUMNS: ColumnMapping = ColumnMapping {
    producer: "driver_csv",
    columns: &[
        (ManifestField::FastqLocation, "FastqDir"),
        (ManifestField::Genome, "Reference"),
        (ManifestField::Species, "Species"),
        (ManifestField::ResultPath, "resultPaths"),
        (ManifestField::OrderId, "Order"),
        (ManifestField::FileName, "fileNames"),
        (ManifestField::Annotation, "Annotation"),
        (ManifestField::LibraryId, "LibraryID"),
        (ManifestField::OrderType, "OrderType"),
        (ManifestField::PiName, "Lab"),
        (ManifestField::Requester, "Requester"),
    ],
};

/// LIMS-derived sample sheet written for Aviti runs. Fastqs are named after the library.
pub static AVITI_COLUMNS: ColumnMapping = ColumnMapping {
    producer: "aviti_samplesheet",
    columns: &[
        (ManifestField::Genome, "genomeVersion"),
        (ManifestField::Species, "speciesName"),
        (ManifestField::ResultPath, "resultPaths"),
        (ManifestField::OrderId, "prnOrderNo"),
        (ManifestField::FileName, "libID"),
        (ManifestField::Annotation, "annotation"),
        (ManifestField::LibraryId, "libID"),
        (ManifestField::OrderType, "orderType"),
        (ManifestField::PiName, "requestingDepartment"),
        (ManifestField::Requester, "requester"),
    ],
};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Standard,
    TenXCapture,
    TenXFlex,
}

impl OrderType {
    /// Maps a LIMS order type label, e.g. `10x_scRNA-Seq_NextGEM`.
    pub fn parse(label: &str) -> Self {
        let lower = label.to_ascii_lowercase();
        if lower.contains("10x") && lower.contains("flex") {
            OrderType::TenXFlex
        } else if lower.contains("10x") {
            OrderType::TenXCapture
        } else {
            OrderType::Standard
        }
    }
}


/// One sequencing library. Values are kept exactly as they appear in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRow {
    pub fastq_location: String,
    pub genome: String,
    pub species: String,
    pub result_path: String,
    pub order_id: String,
    pub file_name: String,
    pub annotation: String,
    pub library_id: String,
    pub order_type: String,
    pub pi_name: String,
    pub requester: String,
    /// Every column of the source row, in header order.
    pub record: Vec<String>,
}

impl ManifestRow {
    pub fn order_kind(&self) -> OrderType {
        OrderType::parse(&self.order_type)
    }

    /// Fastq directory, resolving relative locations against the run's fastq source.
    /// An empty location is the source itself.
    pub fn fastq_dir(&self, source_dir: &Path) -> PathBuf {
        if self.fastq_location.is_empty() {
            return source_dir.to_path_buf();
        }
        let location = PathBuf::from(&self.fastq_location);
        if location.is_absolute() { location } else { source_dir.join(location) }
    }
}


#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub rows: Vec<Arc<ManifestRow>>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keeps only the rows of one order group.
    pub fn retain_order(&mut self, order_id: &str) {
        let before = self.rows.len();
        self.rows.retain(|row| row.order_id == order_id);
        info!("Order filter {} kept {} of {} libraries", order_id, self.rows.len(), before);
    }

    /// Distinct result paths in first-seen row order.
    pub fn result_paths(&self) -> Vec<String> {
        distinct_result_paths(self.rows.iter().map(|r| r.as_ref()))
    }
}

pub fn distinct_result_paths<'a>(rows: impl Iterator<Item = &'a ManifestRow>) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for row in rows {
        if !paths.contains(&row.result_path) {
            paths.push(row.result_path.clone());
        }
    }
    paths
}


/// Loads a manifest file.
///
/// # Arguments
///
/// * `path` - CSV with a header row.
/// * `mapping` - Column mapping of the producer that wrote it.
///
/// # Returns
/// Manifest with rows in file order.
pub async fn load_manifest(path: &Path, mapping: &ColumnMapping) -> Result<Manifest, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| malformed(path, format!("cannot open: {}", e)))?;
    read_manifest(bytes.as_slice(), path, mapping)
}

/// Parses a manifest from any reader. `path` is only used in errors.
pub fn read_manifest<R: Read>(
    reader: R,
    path: &Path,
    mapping: &ColumnMapping,
) -> Result<Manifest, PipelineError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::None)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| malformed(path, e.to_string()))?
        .iter()
        .map(String::from)
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(malformed(path, "missing header row".to_string()));
    }

    let mut index: HashMap<ManifestField, usize> = HashMap::new();
    for (field, column) in mapping.columns {
        match headers.iter().position(|h| h == column) {
            Some(i) => { index.insert(*field, i); }
            None if field.required() => {
                return Err(malformed(path, format!("required column '{}' absent ({} layout)", column, mapping.producer)));
            }
            None => debug!("Optional column '{}' absent from {:?}", column, path),
        }
    }

    let mut rows = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| malformed(path, e.to_string()))?;
        let value = |field: ManifestField| -> String {
            index
                .get(&field)
                .and_then(|&i| record.get(i))
                .unwrap_or_default()
                .to_string()
        };
        let row = ManifestRow {
            fastq_location: value(ManifestField::FastqLocation),
            genome: value(ManifestField::Genome),
            species: value(ManifestField::Species),
            result_path: value(ManifestField::ResultPath),
            order_id: value(ManifestField::OrderId),
            file_name: value(ManifestField::FileName),
            annotation: value(ManifestField::Annotation),
            library_id: value(ManifestField::LibraryId),
            order_type: value(ManifestField::OrderType),
            pi_name: value(ManifestField::PiName),
            requester: value(ManifestField::Requester),
            record: record.iter().map(String::from).collect(),
        };
        // Header is line 1.
        check_row(&row, line + 2, path, mapping)?;
        rows.push(Arc::new(row));
    }

    check_run(&rows, path)?;
    info!("Loaded {} libraries from {:?}", rows.len(), path);

    Ok(Manifest { path: path.to_path_buf(), headers, rows })
}

fn check_row(row: &ManifestRow, line: usize, path: &Path, mapping: &ColumnMapping) -> Result<(), PipelineError> {
    if mapping.has_fastq_location() && row.fastq_location.is_empty() {
        return Err(malformed(path, format!("line {}: empty fastq location", line)));
    }
    if row.result_path.is_empty() {
        return Err(malformed(path, format!("line {}: empty result path", line)));
    }
    if row.file_name.is_empty() {
        return Err(malformed(path, format!("line {}: empty file name", line)));
    }
    Ok(())
}

/// Driver keys and file names are unique, and every order publishes to exactly
/// one result path. Per-library outputs are named after the file name.
fn check_run(rows: &[Arc<ManifestRow>], path: &Path) -> Result<(), PipelineError> {
    let mut keys: HashMap<(&str, &str), usize> = HashMap::new();
    let mut file_names: HashMap<&str, usize> = HashMap::new();
    let mut order_paths: HashMap<&str, &str> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if let Some(first) = keys.insert((&row.order_id, &row.library_id), i) {
            return Err(malformed(path, format!(
                "library {} of order {} appears on data rows {} and {}",
                row.library_id, row.order_id, first + 1, i + 1
            )));
        }
        if let Some(first) = file_names.insert(&row.file_name, i) {
            return Err(malformed(path, format!(
                "file name {} is used by data rows {} and {}",
                row.file_name, first + 1, i + 1
            )));
        }
        match order_paths.get(row.order_id.as_str()) {
            Some(existing) if *existing != row.result_path => {
                return Err(malformed(path, format!(
                    "order {} has more than one result path: {} and {}",
                    row.order_id, existing, row.result_path
                )));
            }
            Some(_) => {}
            None => { order_paths.insert(&row.order_id, &row.result_path); }
        }
    }
    Ok(())
}

fn malformed(path: &Path, reason: String) -> PipelineError {
    PipelineError::MalformedManifest { path: path.to_path_buf(), reason }
}
