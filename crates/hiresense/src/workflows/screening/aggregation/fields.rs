/// Columns of the canonical ranked artifact, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    CandidateId,
    GradeScore,
    PersonaFitScore,
    BiasFlags,
    Explanation,
    UpdatedScore,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 6] = [
        CanonicalField::CandidateId,
        CanonicalField::GradeScore,
        CanonicalField::PersonaFitScore,
        CanonicalField::BiasFlags,
        CanonicalField::Explanation,
        CanonicalField::UpdatedScore,
    ];

    pub const fn column(self) -> &'static str {
        match self {
            CanonicalField::CandidateId => "candidate_filename",
            CanonicalField::GradeScore => "grade_score",
            CanonicalField::PersonaFitScore => "persona_fit_score",
            CanonicalField::BiasFlags => "cv_bias_flags",
            CanonicalField::Explanation => "explanation",
            CanonicalField::UpdatedScore => "updated_score",
        }
    }

    /// Header names stages use for this field, checked in order.
    pub const fn source_columns(self) -> &'static [&'static str] {
        match self {
            CanonicalField::CandidateId => &["candidate_filename", "candidate_id", "Candidate"],
            CanonicalField::GradeScore => &["grade_score", "CV_Score"],
            CanonicalField::PersonaFitScore => &["persona_fit_score", "Persona_Score"],
            CanonicalField::BiasFlags => &["cv_bias_flags", "Bias_Flags"],
            CanonicalField::Explanation => &["explanation", "Explanation"],
            CanonicalField::UpdatedScore => &["updated_score"],
        }
    }
}

/// What the aggregator does when a stage table has no value for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Absence fails the run.
    Required,
    /// Absence is filled with this raw value.
    Default(&'static str),
    /// Computed by the aggregator, never read from a stage.
    Derived,
}

pub const DEFAULT_PERSONA_FIT: &str = "0";
pub const DEFAULT_BIAS_FLAGS: &str = "[]";
pub const DEFAULT_EXPLANATION: &str = "No explanation provided";

const FIELD_POLICIES: [(CanonicalField, FieldPolicy); 6] = [
    (CanonicalField::CandidateId, FieldPolicy::Required),
    (CanonicalField::GradeScore, FieldPolicy::Required),
    (
        CanonicalField::PersonaFitScore,
        FieldPolicy::Default(DEFAULT_PERSONA_FIT),
    ),
    (CanonicalField::BiasFlags, FieldPolicy::Default(DEFAULT_BIAS_FLAGS)),
    (
        CanonicalField::Explanation,
        FieldPolicy::Default(DEFAULT_EXPLANATION),
    ),
    (CanonicalField::UpdatedScore, FieldPolicy::Derived),
];

pub fn policy_for(field: CanonicalField) -> FieldPolicy {
    FIELD_POLICIES
        .iter()
        .find(|(candidate, _)| *candidate == field)
        .map(|(_, policy)| *policy)
        .unwrap_or(FieldPolicy::Required)
}

/// Raw fallback for a field whose policy allows one.
pub fn default_for(field: CanonicalField) -> Option<&'static str> {
    match policy_for(field) {
        FieldPolicy::Default(value) => Some(value),
        FieldPolicy::Required | FieldPolicy::Derived => None,
    }
}
