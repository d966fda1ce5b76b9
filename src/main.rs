use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use campus_behavior_insight::aggregate;
use campus_behavior_insight::config::AnalysisConfig;
use campus_behavior_insight::db;
use campus_behavior_insight::ideology;
use campus_behavior_insight::models::StreamKind;
use campus_behavior_insight::poverty;
use campus_behavior_insight::report;
use campus_behavior_insight::risk;

#[derive(Parser)]
#[command(name = "campus-insight")]
#[command(about = "Student behavior analytics over campus event streams", long_about = None)]
struct Cli {
    /// Override analysis parameters as key=value pairs, e.g. contamination=0.2
    #[arg(long = "set", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import one stream's events from a CSV file
    Import {
        #[arg(long)]
        stream: StreamKind,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the comprehensive risk analysis
    Analyze,
    /// Build three-axis engagement profiles
    Ideology,
    /// Classify economic-distress tiers
    Poverty,
    /// Materialize daily aggregates for a date range
    Aggregate {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Run all three analyses and write a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let config =
        AnalysisConfig::default().apply_overrides(&cli.overrides.iter().cloned().collect());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { stream, csv } => {
            let report = db::import_csv(&pool, stream, &csv).await?;
            println!(
                "Imported {} {stream} rows from {} ({} rejected).",
                report.inserted,
                csv.display(),
                report.rejected_total
            );
            for (line, error) in report.rejected.iter().take(10) {
                println!("  row {line}: {error}");
            }
        }
        Commands::Analyze => {
            let students = db::fetch_student_ids(&pool).await?;
            let batch = db::load_batch(&pool, &students).await?;
            let analysis = risk::analyze_population(&batch, &config);

            println!(
                "{} of {} students flagged:",
                analysis.summary.flagged_students, analysis.summary.total_students
            );
            for record in analysis.records.iter() {
                println!(
                    "- {} [{}]: {}",
                    record.student_id,
                    record.level,
                    record.reasons.join("; ")
                );
            }
        }
        Commands::Ideology => {
            let students = db::fetch_student_ids(&pool).await?;
            let batch = db::load_batch(&pool, &students).await?;
            let analysis = ideology::classify_population(&batch.network, &batch.grades, &config);

            println!(
                "{} students profiled, {} on close watch:",
                analysis.summary.total_students, analysis.summary.close_watch
            );
            for profile in analysis.profiles.iter() {
                println!(
                    "- {} ({}) -> {}",
                    profile.student_id, profile.archetype, profile.strategy
                );
            }
        }
        Commands::Poverty => {
            let students = db::fetch_student_ids(&pool).await?;
            let batch = db::load_batch(&pool, &students).await?;
            let analysis = poverty::analyze_population(&batch.consumption, &batch.gate, &config);

            println!(
                "{} of {} students in an assistance tier:",
                analysis.summary.assisted_students, analysis.summary.total_students
            );
            for record in analysis.records.iter() {
                println!(
                    "- {} [{}] monthly mean {:.1}",
                    record.student_id, record.tier, record.monthly_mean
                );
            }
        }
        Commands::Aggregate { start, end } => {
            anyhow::ensure!(start <= end, "start date must not be after end date");
            let students = db::fetch_student_ids(&pool).await?;
            let existing = db::fetch_aggregate_keys(&pool, &students, start, end).await?;
            let source = db::PgEventSource::new(pool.clone(), tokio::runtime::Handle::current());
            let plan =
                aggregate::aggregate_range(&source, &students, start, end, &existing, &config)?;
            let flush = db::write_aggregates(&pool, &plan).await?;

            if let Some(error) = &flush.error {
                println!(
                    "Partial flush: {} created, {} updated, then failed: {error}",
                    flush.created, flush.updated
                );
                std::process::exit(1);
            }
            println!(
                "Aggregated {} students x {} days: {} created, {} updated.",
                students.len(),
                (end - start).num_days() + 1,
                flush.created,
                flush.updated
            );
        }
        Commands::Report { out } => {
            let students = db::fetch_student_ids(&pool).await?;
            let batch = db::load_batch(&pool, &students).await?;
            let risk = risk::analyze_population(&batch, &config);
            let ideology = ideology::classify_population(&batch.network, &batch.grades, &config);
            let poverty = poverty::analyze_population(&batch.consumption, &batch.gate, &config);

            let report = report::build_report(&risk, &ideology, &poverty);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
