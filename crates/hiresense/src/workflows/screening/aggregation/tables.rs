use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;

use csv::StringRecord;

use super::fields::CanonicalField;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("failed to open artifact: {0}")]
    Io(#[from] io::Error),
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("no candidate identifier column (expected one of: {expected})")]
    MissingKeyColumn { expected: String },
    #[error("row {row} has an empty candidate identifier")]
    EmptyKey { row: usize },
}

/// A stage's CSV output indexed by candidate identifier.
#[derive(Debug)]
pub(crate) struct ArtifactTable {
    headers: Vec<String>,
    rows: Vec<StringRecord>,
    index: HashMap<String, usize>,
    key_column: usize,
    duplicates: Vec<String>,
}

impl ArtifactTable {
    pub(crate) fn from_path(path: &Path) -> Result<Self, TableError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub(crate) fn from_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|header| header.trim_start_matches('\u{feff}').to_string())
            .collect();

        let key_column = find_column(&headers, CanonicalField::CandidateId).ok_or_else(|| {
            TableError::MissingKeyColumn {
                expected: CanonicalField::CandidateId.source_columns().join(", "),
            }
        })?;

        let mut rows = Vec::new();
        let mut index = HashMap::new();
        let mut duplicates = Vec::new();

        for (row, record) in csv_reader.records().enumerate() {
            let record = record?;
            let key = record.get(key_column).unwrap_or_default();
            if key.is_empty() {
                return Err(TableError::EmptyKey { row: row + 1 });
            }
            if index.contains_key(key) {
                duplicates.push(key.to_string());
                continue;
            }
            index.insert(key.to_string(), rows.len());
            rows.push(record);
        }

        Ok(Self {
            headers,
            rows,
            index,
            key_column,
            duplicates,
        })
    }

    pub(crate) fn column(&self, field: CanonicalField) -> Option<usize> {
        find_column(&self.headers, field)
    }

    /// Candidate identifiers in file order, first occurrence only.
    pub(crate) fn candidates(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .filter_map(|row| row.get(self.key_column))
    }

    /// Non-empty cell for `candidate`, if the candidate has a row.
    pub(crate) fn value(&self, candidate: &str, column: usize) -> Option<&str> {
        let row = self.index.get(candidate)?;
        self.rows[*row].get(column).filter(|value| !value.is_empty())
    }

    /// Identifiers that appeared more than once; only the first row was kept.
    pub(crate) fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

fn find_column(headers: &[String], field: CanonicalField) -> Option<usize> {
    field
        .source_columns()
        .iter()
        .find_map(|name| headers.iter().position(|header| header == name))
}
