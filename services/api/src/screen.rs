use crate::infra::InMemoryRunRepository;
use clap::Args;
use hiresense::config::AppConfig;
use hiresense::error::AppError;
use hiresense::telemetry;
use hiresense::workflows::screening::{
    write_ranked_csv, CandidateDocument, JobPosting, PipelineDefinition, RankedCandidate,
    ScreeningRequest, ScreeningService,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct ScreenArgs {
    /// Job title written to the job posting descriptor
    #[arg(long)]
    pub(crate) job_title: String,
    /// Job description text
    #[arg(long, conflicts_with = "job_file", required_unless_present = "job_file")]
    pub(crate) job_description: Option<String>,
    /// Read the job description from a file instead
    #[arg(long)]
    pub(crate) job_file: Option<PathBuf>,
    /// Directory of candidate CVs (PDF or plain text)
    #[arg(long)]
    pub(crate) cv_dir: PathBuf,
    /// Number of top candidates to show (0 shows all; defaults to HIRESENSE_TOP_N)
    #[arg(long)]
    pub(crate) top_n: Option<usize>,
    /// Write the ranked shortlist as CSV to this path
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

pub(crate) fn run_screen(args: ScreenArgs) -> Result<(), AppError> {
    let ScreenArgs {
        job_title,
        job_description,
        job_file,
        cv_dir,
        top_n,
        output,
    } = args;

    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let description = match (job_description, job_file) {
        (Some(description), _) => description,
        (None, Some(path)) => fs::read_to_string(path)?,
        (None, None) => String::new(),
    };
    let documents = collect_documents(&cv_dir)?;

    let definition = PipelineDefinition::hiresense(&config.pipeline.interpreter);
    let service = ScreeningService::new(
        &config.pipeline,
        definition,
        Arc::new(InMemoryRunRepository::default()),
    )?;

    println!(
        "Screening {} CVs from {} against \"{}\"",
        documents.len(),
        cv_dir.display(),
        job_title
    );
    let outcome = service.run(ScreeningRequest {
        job: JobPosting {
            title: job_title,
            description,
        },
        documents,
        top_n,
    })?;

    println!("Run {} completed {} stages", outcome.run_id, outcome.stage_log.len());
    for execution in &outcome.stage_log {
        println!("- {} ({} ms)", execution.stage, execution.duration_ms);
    }
    render_shortlist(&outcome.ranked);

    if let Some(path) = outcome.published_to {
        println!("Canonical artifact: {}", path.display());
    }
    if let Some(path) = output {
        let file = fs::File::create(&path)?;
        write_ranked_csv(file, &outcome.ranked).map_err(std::io::Error::from)?;
        println!("Shortlist written to {}", path.display());
    }

    Ok(())
}

/// Loads every PDF or plain-text file directly inside `dir`, sorted by file name.
pub(crate) fn collect_documents(dir: &Path) -> Result<Vec<CandidateDocument>, AppError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_candidate_document(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some(fs::read(&path).map(|content| CandidateDocument::new(name, content)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(AppError::from)
}

fn is_candidate_document(path: &Path) -> bool {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    matches!(mime.essence_str(), "application/pdf" | "text/plain")
}

fn render_shortlist(ranked: &[RankedCandidate]) {
    if ranked.is_empty() {
        println!("No candidates were graded.");
        return;
    }

    println!("\nTop {} candidates", ranked.len());
    for candidate in ranked {
        println!(
            "{:>3}. {} | match {:.1}% | CV {:.1}% | persona {:.1}% | bias-free {:.0}%",
            candidate.rank,
            candidate.candidate,
            candidate.match_score,
            candidate.cv_score,
            candidate.persona_score,
            candidate.bias_free_score
        );
        println!("     {}", candidate.explanation);
    }
}
