//! `sow` - drive a case through the pipeline from files on disk

use anyhow::{anyhow, bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command, ValueEnum};
use serde::Serialize;
use sow_artifact::{ArtifactRef, ArtifactStore, CaseId, FsArtifactStore, MemoryArtifactStore, Stage};
use sow_core::{
    CaseStage, ErrorReport, ExtractiveWriter, Intake, Orchestrator, OverrideTarget, PipelineConfig, PipelineError,
    ReviewReport, TaxonomyPlanner,
};
use sow_retrieval::{validate_kb, LocalCorpus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Last step `run` performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Through {
    Plan,
    Retrieve,
    Assemble,
    Write,
    Review,
    Approve,
}

fn cli() -> Command {
    Command::new("sow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Grounded Statement-of-Work synthesis")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("run")
                .about("Run one intake through PLAN -> RETRIEVE -> ASSEMBLE -> WRITE -> REVIEW")
                .arg(
                    Arg::new("intake")
                        .long("intake")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Intake record (.json, .yaml or .yml)"),
                )
                .arg(
                    Arg::new("corpus")
                        .long("corpus")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Clause corpus as JSONL"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Pipeline config (.toml, .yaml or .yml) holding the section taxonomy"),
                )
                .arg(
                    Arg::new("document-type")
                        .long("document-type")
                        .default_value("sow")
                        .help("Taxonomy key to plan against"),
                )
                .arg(
                    Arg::new("store")
                        .long("store")
                        .value_parser(value_parser!(PathBuf))
                        .help("Persist artifacts under this directory instead of in memory"),
                )
                .arg(
                    Arg::new("through")
                        .long("through")
                        .default_value("approve")
                        .value_parser(value_parser!(Through))
                        .help("Stop after this step"),
                )
                .arg(
                    Arg::new("approver")
                        .long("approver")
                        .default_value("cli")
                        .help("Identity recorded on the plan lock, overrides and approval"),
                )
                .arg(
                    Arg::new("override")
                        .long("override")
                        .action(ArgAction::Append)
                        .help("Gate override: evidence:SECTION, conflict:SECTION:LEFT:RIGHT or finding:ID (write ':' inside a conflict part as %3A)"),
                )
                .arg(
                    Arg::new("override-reason")
                        .long("override-reason")
                        .default_value("accepted at the command line")
                        .help("Reason recorded on every --override"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the rendered markdown draft here"),
                )
                .arg(
                    Arg::new("diagnostics")
                        .long("diagnostics")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the case's diagnostics log here as JSONL"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the run summary as JSON"),
                ),
        )
        .subcommand(
            Command::new("validate-kb")
                .about("Check clause corpus metadata")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Corpus JSONL file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("Print a stored artifact")
                .arg(
                    Arg::new("store")
                        .long("store")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Artifact store directory"),
                )
                .arg(Arg::new("case").long("case").required(true).help("Case id"))
                .arg(
                    Arg::new("stage")
                        .long("stage")
                        .required(true)
                        .help("PLAN, RETRIEVAL_SET, ASSEMBLY_BLUEPRINT, DRAFT or REVIEW_REPORT"),
                )
                .arg(
                    Arg::new("version")
                        .long("version")
                        .value_parser(value_parser!(u32))
                        .help("Version to read; defaults to the newest"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let outcome = match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        Some(("validate-kb", args)) => validate_kb_file(args).await,
        Some(("show", args)) => show(args).await,
        _ => Err(anyhow!("no command given")),
    };

    match outcome {
        Ok(passed) => std::process::exit(if passed { 0 } else { 1 }),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}

// ----------------------------------------------------------------------
// run
// ----------------------------------------------------------------------

#[derive(Debug)]
struct RunOptions {
    through: Through,
    approver: String,
    overrides: Vec<OverrideTarget>,
    override_reason: String,
}

#[derive(Debug, Serialize)]
struct ReviewCounts {
    critical: usize,
    warning: usize,
    info: usize,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    case_id: CaseId,
    stage: CaseStage,
    artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    review: Option<ReviewCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

fn required_path<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a PathBuf> {
    args.get_one::<PathBuf>(name)
        .ok_or_else(|| anyhow!("--{name} is required"))
}

fn string_arg(args: &ArgMatches, name: &str) -> String {
    args.get_one::<String>(name).cloned().unwrap_or_default()
}

fn parse_overrides(values: &[String]) -> Result<Vec<OverrideTarget>> {
    values
        .iter()
        .map(|v| v.parse::<OverrideTarget>().map_err(|e| anyhow!("--override {v}: {e}")))
        .collect()
}

async fn load_intake(path: &Path) -> Result<Intake> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading intake {}", path.display()))?;
    let intake = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?,
        Some("json") => serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?,
        other => bail!("unsupported intake format: {}", other.unwrap_or("<none>")),
    };
    Ok(intake)
}

async fn open_store(dir: Option<&PathBuf>) -> Result<Arc<dyn ArtifactStore>> {
    Ok(match dir {
        Some(dir) => Arc::new(
            FsArtifactStore::open(dir.clone())
                .await
                .with_context(|| format!("opening store {}", dir.display()))?,
        ),
        None => Arc::new(MemoryArtifactStore::new()),
    })
}

async fn run(args: &ArgMatches) -> Result<bool> {
    let document_type = string_arg(args, "document-type");
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::load(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if config.taxonomy_for(&document_type).is_empty() {
        bail!("config has no taxonomy for document type {document_type:?}");
    }

    let intake = load_intake(required_path(args, "intake")?).await?;
    let corpus_path = required_path(args, "corpus")?;
    let corpus = LocalCorpus::from_jsonl_file(corpus_path)
        .await
        .with_context(|| format!("loading corpus {}", corpus_path.display()))?;
    let store = open_store(args.get_one::<PathBuf>("store")).await?;

    let overrides: Vec<String> = args
        .get_many::<String>("override")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let opts = RunOptions {
        through: args.get_one::<Through>("through").copied().unwrap_or(Through::Approve),
        approver: string_arg(args, "approver"),
        overrides: parse_overrides(&overrides)?,
        override_reason: string_arg(args, "override-reason"),
    };

    let orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(corpus),
        Arc::new(TaxonomyPlanner),
        Arc::new(ExtractiveWriter),
    )?;
    let case_id = orchestrator.create_case(intake, document_type);
    info!(case_id = %case_id, through = ?opts.through, "running case");

    let outcome = drive(&orchestrator, case_id, &opts).await;
    if let Err(err) = &outcome {
        warn!(case_id = %case_id, kind = %err.kind(), "run stopped: {err}");
    }
    let summary = summarize(&orchestrator, case_id, outcome.err().map(|e| e.to_report())).await?;

    if let Some(path) = args.get_one::<PathBuf>("output") {
        if summary.stage >= CaseStage::Drafted {
            let markdown = orchestrator.render_markdown(case_id).await?;
            tokio::fs::write(path, markdown)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        } else {
            warn!(path = %path.display(), "no draft to render");
        }
    }
    if let Some(path) = args.get_one::<PathBuf>("diagnostics") {
        let mut lines = String::new();
        for event in orchestrator.diagnostics(case_id) {
            lines.push_str(&serde_json::to_string(&event)?);
            lines.push('\n');
        }
        tokio::fs::write(path, lines)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(summary.error.is_none())
}

async fn drive(orch: &Orchestrator, case_id: CaseId, opts: &RunOptions) -> Result<(), PipelineError> {
    for target in &opts.overrides {
        orch.add_override(case_id, target.clone(), &opts.override_reason, &opts.approver)?;
    }

    let plan = orch.run_plan(case_id, None).await?;
    if opts.through == Through::Plan {
        return Ok(());
    }
    orch.lock_plan(case_id, plan.version(), &opts.approver).await?;
    orch.run_retrieve(case_id).await?;
    if opts.through == Through::Retrieve {
        return Ok(());
    }
    orch.run_assemble(case_id).await?;
    if opts.through == Through::Assemble {
        return Ok(());
    }
    orch.run_write(case_id).await?;
    if opts.through == Through::Write {
        return Ok(());
    }
    orch.run_review(case_id).await?;
    if opts.through == Through::Review {
        return Ok(());
    }
    orch.approve(case_id, &opts.approver).await?;
    Ok(())
}

async fn summarize(orch: &Orchestrator, case_id: CaseId, error: Option<ErrorReport>) -> Result<RunSummary> {
    let case = orch.get_case(case_id)?;
    let mut artifacts = Vec::new();
    let mut review = None;
    for stage in Stage::ALL {
        let Some(artifact) = orch.get_artifact(case_id, stage, None).await? else {
            continue;
        };
        artifacts.push(artifact.reference());
        if stage == Stage::Review {
            let report: ReviewReport = artifact.decode()?;
            review = Some(ReviewCounts {
                critical: report.critical,
                warning: report.warning,
                info: report.info,
            });
        }
    }
    Ok(RunSummary {
        case_id,
        stage: case.stage,
        artifacts,
        review,
        error,
    })
}

fn print_summary(summary: &RunSummary) {
    println!("case {} at {}", summary.case_id, summary.stage);
    for artifact in &summary.artifacts {
        println!("  {} v{} {}", artifact.stage, artifact.version, artifact.checksum.short());
    }
    if let Some(review) = &summary.review {
        println!(
            "  review: {} critical, {} warning, {} info",
            review.critical, review.warning, review.info
        );
    }
    if let Some(error) = &summary.error {
        println!("stopped: {} {}", error.kind, error.message);
        for field in &error.fields {
            println!("  missing {field}");
        }
        for hint in &error.hints {
            println!("  hint: {} {}", hint.action, hint.target);
        }
    }
}

// ----------------------------------------------------------------------
// validate-kb / show
// ----------------------------------------------------------------------

async fn validate_kb_file(args: &ArgMatches) -> Result<bool> {
    let path = required_path(args, "file")?;
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let report = validate_kb(&content);

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}: {} records, {} issues", path.display(), report.records, report.issues.len());
        for issue in &report.issues {
            println!("  {issue}");
        }
    }
    Ok(report.passed())
}

async fn show(args: &ArgMatches) -> Result<bool> {
    let store = FsArtifactStore::open(required_path(args, "store")?.clone()).await?;
    let case_id: CaseId = string_arg(args, "case").parse().context("invalid case id")?;
    let stage: Stage = string_arg(args, "stage").parse().map_err(|e: String| anyhow!(e))?;

    let artifact = match args.get_one::<u32>("version") {
        Some(version) => store.get(case_id, stage, *version).await?,
        None => store.latest(case_id, stage).await?,
    };
    let Some(artifact) = artifact else {
        eprintln!("no {stage} artifact for case {case_id}");
        return Ok(false);
    };
    let superseded = store.superseded(case_id, stage).await?;
    if superseded.contains(&artifact.version()) {
        warn!(version = artifact.version(), "artifact is superseded");
    }
    println!("{}", serde_json::to_string_pretty(&artifact)?);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let matches = cli()
            .try_get_matches_from([
                "sow",
                "run",
                "--intake",
                "intake.json",
                "--corpus",
                "kb.jsonl",
                "--through",
                "write",
                "--override",
                "evidence:Scope",
                "--override",
                "finding:F-1",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(args.get_one::<Through>("through"), Some(&Through::Write));
        assert_eq!(string_arg(args, "document-type"), "sow");
        let values: Vec<String> = args.get_many::<String>("override").unwrap().cloned().collect();
        assert_eq!(parse_overrides(&values).unwrap().len(), 2);
    }

    #[test]
    fn bad_override_names_the_flag() {
        let err = parse_overrides(&["waiver:x".to_string()]).unwrap_err();
        assert!(err.to_string().contains("--override waiver:x"));
    }

    fn fixture(name: &str) -> String {
        format!("{}/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    fn subcommand_args(argv: &[&str]) -> ArgMatches {
        let matches = cli().try_get_matches_from(argv).unwrap();
        matches.subcommand().unwrap().1.clone()
    }

    #[tokio::test]
    async fn fixture_corpus_passes_kb_validation() {
        let args = subcommand_args(&["sow", "validate-kb", &fixture("corpus.jsonl")]);
        assert!(validate_kb_file(&args).await.unwrap());
    }

    #[tokio::test]
    async fn fixtures_run_to_approval_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let output = dir.path().join("sow.md");
        let diagnostics = dir.path().join("events.jsonl");
        let args = subcommand_args(&[
            "sow",
            "run",
            "--intake",
            &fixture("intake.json"),
            "--corpus",
            &fixture("corpus.jsonl"),
            "--config",
            &fixture("pipeline.toml"),
            "--store",
            store.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--diagnostics",
            diagnostics.to_str().unwrap(),
            "--json",
        ]);
        assert!(run(&args).await.unwrap());

        let markdown = tokio::fs::read_to_string(&output).await.unwrap();
        assert!(markdown.contains("Limitation of Liability"));
        let events = tokio::fs::read_to_string(&diagnostics).await.unwrap();
        assert!(events.lines().count() >= 5);
    }

    #[tokio::test]
    async fn missing_taxonomy_is_reported_before_running() {
        let args = subcommand_args(&[
            "sow",
            "run",
            "--intake",
            &fixture("intake.json"),
            "--corpus",
            &fixture("corpus.jsonl"),
        ]);
        let err = run(&args).await.unwrap_err();
        assert!(err.to_string().contains("no taxonomy"));
    }

    #[tokio::test]
    async fn intake_format_follows_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("intake.yaml");
        tokio::fs::write(&yaml, "scope: claims triage\njurisdiction: US\n").await.unwrap();
        let intake = load_intake(&yaml).await.unwrap();
        assert_eq!(intake.jurisdiction.as_deref(), Some("US"));

        let txt = dir.path().join("intake.txt");
        tokio::fs::write(&txt, "scope").await.unwrap();
        assert!(load_intake(&txt).await.is_err());
    }
}
