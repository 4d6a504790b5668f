use clap::{Args, Parser, Subcommand};
use sessionmerge::config::PipelineConfig;
use sessionmerge::filter::{EventFilter, KindFilter, SessionFilter, TimeWindowFilter};
use sessionmerge::{Pipeline, PipelineError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sessionmerge")]
#[command(about = "Consolidates fragmented session archives into clean, time-ordered archives", long_about = None)]
struct Cli {
    #[command(flatten)]
    dirs: DirArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DirArgs {
    /// Base directory holding raw/, merged/ and final/ (defaults to $SESSIONMERGE_STATE_DIR)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    /// Override the raw archive root
    #[arg(long, global = true)]
    raw: Option<PathBuf>,
    /// Override the merged archive root
    #[arg(long, global = true)]
    merged: Option<PathBuf>,
    /// Override the final archive root
    #[arg(long = "final", global = true)]
    final_dir: Option<PathBuf>,
    /// Worker pool size (defaults to $SESSIONMERGE_WORKERS or the number of cores)
    #[arg(long, short = 'w', global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read, group, merge and clean every raw archive
    Run {
        /// Drop events of this kind (repeatable)
        #[arg(long = "exclude-kind")]
        exclude_kinds: Vec<String>,
        /// Drop events of this session (repeatable)
        #[arg(long = "exclude-session")]
        exclude_sessions: Vec<String>,
        /// Keep only events triggered at or after this unix millisecond
        #[arg(long)]
        from: Option<i64>,
        /// Keep only events triggered before this unix millisecond
        #[arg(long)]
        to: Option<i64>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Only read identifiers and print how archives would be grouped
    Groups {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn build_config(dirs: DirArgs) -> Result<PipelineConfig, PipelineError> {
    let mut config = match dirs.base_dir {
        Some(base) => PipelineConfig::from_base_dir(base),
        None => PipelineConfig::from_env()?,
    };
    if let Some(raw) = dirs.raw {
        config.raw_dir = raw;
    }
    if let Some(merged) = dirs.merged {
        config.merged_dir = merged;
    }
    if let Some(final_dir) = dirs.final_dir {
        config.final_dir = final_dir;
    }
    if let Some(workers) = dirs.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn build_filters(
    exclude_kinds: Vec<String>,
    exclude_sessions: Vec<String>,
    from: Option<i64>,
    to: Option<i64>,
) -> Result<Vec<Box<dyn EventFilter>>, PipelineError> {
    let mut filters: Vec<Box<dyn EventFilter>> = Vec::new();
    for kind in exclude_kinds {
        filters.push(Box::new(KindFilter::new(kind)));
    }
    if !exclude_sessions.is_empty() {
        filters.push(Box::new(SessionFilter::new(exclude_sessions)));
    }
    if from.is_some() || to.is_some() {
        filters.push(Box::new(TimeWindowFilter::new(from, to)?));
    }
    Ok(filters)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(value).map_err(|e| PipelineError::Other(format!("json: {}", e)))
}

fn main() -> Result<(), PipelineError> {
    init_tracing();
    let cli = Cli::parse();
    let config = build_config(cli.dirs)?;

    match cli.command {
        Commands::Run {
            exclude_kinds,
            exclude_sessions,
            from,
            to,
            json,
        } => {
            let filters = build_filters(exclude_kinds, exclude_sessions, from, to)?;
            let summary = Pipeline::from_config(&config, filters)?.run()?;
            if json {
                println!("{}", to_json(&summary)?);
            } else {
                println!("archives read:  {}", summary.archives_read);
                println!("identifiers:    {}", summary.distinct_identifiers);
                println!("groups:         {}", summary.groups);
                println!("cleaned:        {}", summary.cleaned);
                println!(
                    "events:         {} -> {}",
                    summary.events_before_cleaning, summary.events_after_cleaning
                );
            }
        }
        Commands::Groups { json } => {
            let grouping = Pipeline::from_config(&config, Vec::new())?.group()?;
            if json {
                println!("{}", to_json(&grouping)?);
            } else {
                for group in &grouping.groups {
                    let members: Vec<&str> = group.archives().iter().map(|a| a.as_str()).collect();
                    println!("{} <- {}", group.representative(), members.join(", "));
                }
                println!(
                    "{} archives, {} identifiers, {} groups",
                    grouping.archives.len(),
                    grouping.distinct_identifiers,
                    grouping.groups.len()
                );
            }
        }
    }

    Ok(())
}
