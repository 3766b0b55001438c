mod bias_flags;
mod fields;
mod scoring;
mod tables;

pub use bias_flags::{flag_count, parse_flag_list};
pub use fields::{policy_for, CanonicalField, FieldPolicy};
pub use scoring::{
    bias_free_fraction, composite_score, BIAS_FREE_WEIGHT, GRADING_WEIGHT, MAX_BIAS_FLAGS,
    PERSONA_WEIGHT,
};
pub use tables::TableError;

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::pipeline::{PipelineDefinition, StageRole};
use fields::default_for;
use tables::ArtifactTable;

/// File name of the canonical ranked artifact inside a workspace.
pub const CANONICAL_ARTIFACT: &str = "final_selected_candidates.csv";

/// One merged row of the canonical artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(rename = "candidate_filename")]
    pub candidate_id: String,
    pub grade_score: f64,
    pub persona_fit_score: f64,
    #[serde(rename = "cv_bias_flags")]
    pub bias_flags: String,
    #[serde(skip)]
    pub bias_flag_count: usize,
    pub explanation: String,
    pub updated_score: f64,
}

/// The aggregated result set and where it was written.
#[derive(Debug, Clone)]
pub struct CanonicalArtifact {
    pub path: PathBuf,
    pub records: Vec<CandidateRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("grading artifact {} was not produced", path.display())]
    MissingAnchor { path: PathBuf },
    #[error("grading artifact {} is unreadable: {source}", path.display())]
    UnreadableAnchor {
        path: PathBuf,
        #[source]
        source: TableError,
    },
    #[error("grading artifact has no grade score column")]
    MissingGradeColumn,
    #[error("candidate `{0}` appears more than once in the grading artifact")]
    DuplicateCandidate(String),
    #[error("candidate `{candidate}` has an invalid grade score `{value}`")]
    InvalidGradeScore { candidate: String, value: String },
    #[error("failed to write canonical artifact {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode canonical artifact: {0}")]
    Encode(#[from] csv::Error),
}

/// Workspace-relative artifact names the aggregator reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSources {
    pub grading: String,
    pub persona_fit: Option<String>,
    pub bias: Option<String>,
    pub explanation: Option<String>,
}

impl ArtifactSources {
    /// Resolves each field's source from the stage roles; `None` when no stage has the role.
    pub fn from_definition(definition: &PipelineDefinition) -> Option<Self> {
        Some(Self {
            grading: definition.artifact_for(StageRole::Grading)?.to_string(),
            persona_fit: definition
                .artifact_for(StageRole::PersonaFit)
                .map(str::to_string),
            bias: definition.artifact_for(StageRole::Bias).map(str::to_string),
            explanation: definition
                .artifact_for(StageRole::Explanation)
                .map(str::to_string),
        })
    }
}

/// Merges stage outputs keyed by candidate identifier into the canonical artifact.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    sources: ArtifactSources,
}

impl ResultAggregator {
    pub fn new(sources: ArtifactSources) -> Self {
        Self { sources }
    }

    /// Reads the stage artifacts under `workspace` and writes the canonical artifact there.
    ///
    /// The grading table is the anchor: every one of its candidates yields exactly one row,
    /// in grading order. Other tables only contribute values, falling back to the field
    /// defaults when a table or a candidate row is absent.
    pub fn aggregate(&self, workspace: &Path) -> Result<CanonicalArtifact, AggregationError> {
        let records = self.merge(workspace)?;
        let path = workspace.join(CANONICAL_ARTIFACT);
        write_atomically(&path, &records)?;

        info!(
            candidates = records.len(),
            artifact = %path.display(),
            "canonical artifact written"
        );
        Ok(CanonicalArtifact { path, records })
    }

    pub fn merge(&self, workspace: &Path) -> Result<Vec<CandidateRecord>, AggregationError> {
        let anchor = load_anchor(&workspace.join(&self.sources.grading))?;
        let grade_column = anchor
            .column(CanonicalField::GradeScore)
            .ok_or(AggregationError::MissingGradeColumn)?;

        let persona_source = FieldSource::load(
            workspace,
            self.sources.persona_fit.as_deref(),
            CanonicalField::PersonaFitScore,
        );
        let bias_source = FieldSource::load(
            workspace,
            self.sources.bias.as_deref(),
            CanonicalField::BiasFlags,
        );
        let explanation_source = FieldSource::load(
            workspace,
            self.sources.explanation.as_deref(),
            CanonicalField::Explanation,
        );

        let mut records = Vec::with_capacity(anchor.len());
        for candidate in anchor.candidates() {
            let raw_grade = anchor.value(candidate, grade_column).unwrap_or_default();
            let grade_score = parse_score(raw_grade).ok_or_else(|| {
                AggregationError::InvalidGradeScore {
                    candidate: candidate.to_string(),
                    value: raw_grade.to_string(),
                }
            })?;

            let persona_fit_score = persona_source.score(candidate);
            let bias_flags = bias_source.text(candidate);
            let bias_flag_count = flag_count(&bias_flags);
            if parse_flag_list(&bias_flags).is_none() {
                debug!(candidate, "bias flags are not a plain list, counting none");
            }
            let explanation = explanation_source.text(candidate);

            records.push(CandidateRecord {
                candidate_id: candidate.to_string(),
                grade_score,
                persona_fit_score,
                updated_score: composite_score(grade_score, persona_fit_score, bias_flag_count),
                bias_flags,
                bias_flag_count,
                explanation,
            });
        }

        Ok(records)
    }
}

fn load_anchor(path: &Path) -> Result<ArtifactTable, AggregationError> {
    if !path.is_file() {
        return Err(AggregationError::MissingAnchor {
            path: path.to_path_buf(),
        });
    }
    let table =
        ArtifactTable::from_path(path).map_err(|source| AggregationError::UnreadableAnchor {
            path: path.to_path_buf(),
            source,
        })?;
    if let Some(duplicate) = table.duplicates().first() {
        return Err(AggregationError::DuplicateCandidate(duplicate.clone()));
    }
    Ok(table)
}

fn parse_score(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|score| score.is_finite())
}

/// One optional field column from an auxiliary stage table.
struct FieldSource {
    field: CanonicalField,
    table: Option<(ArtifactTable, usize)>,
}

impl FieldSource {
    fn load(workspace: &Path, artifact: Option<&str>, field: CanonicalField) -> Self {
        let table = artifact.and_then(|artifact| {
            let path = workspace.join(artifact);
            if !path.is_file() {
                debug!(artifact, ?field, "artifact absent, using defaults");
                return None;
            }
            let table = match ArtifactTable::from_path(&path) {
                Ok(table) => table,
                Err(err) => {
                    warn!(artifact, error = %err, "artifact unreadable, using defaults");
                    return None;
                }
            };
            if !table.duplicates().is_empty() {
                warn!(
                    artifact,
                    duplicates = ?table.duplicates(),
                    "repeated candidates, keeping first rows"
                );
            }
            match table.column(field) {
                Some(column) => Some((table, column)),
                None => {
                    warn!(artifact, ?field, "column missing, using defaults");
                    None
                }
            }
        });

        Self { field, table }
    }

    fn raw(&self, candidate: &str) -> Option<&str> {
        self.table
            .as_ref()
            .and_then(|(table, column)| table.value(candidate, *column))
    }

    fn text(&self, candidate: &str) -> String {
        self.raw(candidate)
            .or_else(|| default_for(self.field))
            .unwrap_or_default()
            .to_string()
    }

    fn score(&self, candidate: &str) -> f64 {
        let fallback = default_for(self.field)
            .and_then(parse_score)
            .unwrap_or_default();
        match self.raw(candidate) {
            Some(raw) => parse_score(raw).unwrap_or_else(|| {
                warn!(
                    candidate,
                    value = raw,
                    field = ?self.field,
                    "unparseable score, using default"
                );
                fallback
            }),
            None => fallback,
        }
    }
}

/// Writes the complete row set to a sibling temp file, then renames it into place.
fn write_atomically(path: &Path, records: &[CandidateRecord]) -> Result<(), AggregationError> {
    let write_error = |source| AggregationError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut file = NamedTempFile::new_in(dir).map_err(write_error)?;
    {
        let mut writer = csv::Writer::from_writer(file.as_file_mut());
        if records.is_empty() {
            writer.write_record(CanonicalField::ALL.iter().map(|field| field.column()))?;
        }
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush().map_err(write_error)?;
    }
    file.as_file_mut().sync_all().map_err(write_error)?;
    file.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}

/// Reads a canonical artifact back, e.g. one published by an earlier run.
pub fn read_canonical(path: &Path) -> Result<Vec<CandidateRecord>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize::<CandidateRecord>()
        .map(|row| {
            row.map(|mut record| {
                record.bias_flag_count = flag_count(&record.bias_flags);
                record
            })
        })
        .collect()
}
