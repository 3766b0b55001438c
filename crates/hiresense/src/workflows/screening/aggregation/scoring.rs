pub const GRADING_WEIGHT: f64 = 0.4;
pub const PERSONA_WEIGHT: f64 = 0.3;
pub const BIAS_FREE_WEIGHT: f64 = 0.3;

/// Flag count at which the bias-free term bottoms out.
pub const MAX_BIAS_FLAGS: usize = 10;

/// Share of the bias term a candidate keeps: 1.0 with no flags, 0.0 at ten or more.
pub fn bias_free_fraction(flag_count: usize) -> f64 {
    let clamped = flag_count.min(MAX_BIAS_FLAGS) as f64;
    1.0 - clamped / MAX_BIAS_FLAGS as f64
}

/// Weighted ranking score written to the `updated_score` column.
pub fn composite_score(grade_score: f64, persona_fit_score: f64, flag_count: usize) -> f64 {
    GRADING_WEIGHT * grade_score
        + PERSONA_WEIGHT * persona_fit_score
        + BIAS_FREE_WEIGHT * bias_free_fraction(flag_count)
}
