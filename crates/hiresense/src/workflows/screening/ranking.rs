use std::cmp::Ordering;
use std::io::Write;

use serde::Serialize;

use super::aggregation::{bias_free_fraction, CandidateRecord};

/// Presenter-facing view of one shortlisted candidate, scores as percentages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub rank: usize,
    pub candidate: String,
    pub match_score: f64,
    pub cv_score: f64,
    pub persona_score: f64,
    pub bias_free_score: f64,
    pub explanation: String,
}

impl RankedCandidate {
    fn from_record(rank: usize, record: &CandidateRecord) -> Self {
        Self {
            rank,
            candidate: record.candidate_id.clone(),
            match_score: record.updated_score * 100.0,
            cv_score: record.grade_score * 100.0,
            persona_score: record.persona_fit_score * 100.0,
            bias_free_score: bias_free_fraction(record.bias_flag_count) * 100.0,
            explanation: record.explanation.clone(),
        }
    }
}

/// Highest composite scores first; ties go to the lower candidate identifier.
/// `top_n == 0` returns every candidate.
pub fn top_candidates(records: &[CandidateRecord], top_n: usize) -> Vec<RankedCandidate> {
    let mut ordered: Vec<&CandidateRecord> = records.iter().collect();
    ordered.sort_by(|a, b| compare_records(a, b));

    let limit = if top_n == 0 { ordered.len() } else { top_n };
    ordered
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(index, record)| RankedCandidate::from_record(index + 1, record))
        .collect()
}

fn compare_records(a: &CandidateRecord, b: &CandidateRecord) -> Ordering {
    b.updated_score
        .total_cmp(&a.updated_score)
        .then_with(|| a.candidate_id.cmp(&b.candidate_id))
}

/// CSV download of a shortlist.
pub fn write_ranked_csv<W: Write>(writer: W, ranked: &[RankedCandidate]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for candidate in ranked {
        writer.serialize(candidate)?;
    }
    writer.flush()?;
    Ok(())
}
