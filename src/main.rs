use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use symdex::{Index, IndexConfig, MatchKind, MatchRule};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "symdex")]
#[command(about = "Categorized key index for source and binary elements")]
struct Cli {
    /// Index file (created if missing)
    #[arg(short, long)]
    index: PathBuf,

    /// Container the indexed documents belong to
    #[arg(short, long)]
    container: String,

    /// Config file (defaults to <config_dir>/symdex/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest `document<TAB>category<TAB>key` lines, then save
    Ingest {
        /// TSV file; a line `-<TAB>document` removes the document
        file: PathBuf,

        /// Documents are full paths under the container
        #[arg(long)]
        absolute: bool,
    },
    /// Query keys in one or more categories
    Query {
        #[arg(long = "category", required = true)]
        categories: Vec<String>,

        /// Key pattern (omit to match every key)
        #[arg(short, long)]
        key: Option<String>,

        #[arg(short, long, value_enum, default_value_t = RuleArg::Exact)]
        rule: RuleArg,

        #[arg(long)]
        case_sensitive: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List indexed document names
    Docs {
        #[arg(short, long)]
        substring: Option<String>,
    },
    /// Show index statistics
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum RuleArg {
    Exact,
    Prefix,
    Pattern,
    Regexp,
    CamelCase,
    CamelCaseSamePartCount,
}

impl RuleArg {
    fn to_rule(self, case_sensitive: bool) -> MatchRule {
        let kind = match self {
            RuleArg::Exact => MatchKind::Exact,
            RuleArg::Prefix => MatchKind::Prefix,
            RuleArg::Pattern => MatchKind::Pattern,
            RuleArg::Regexp => MatchKind::Regexp,
            RuleArg::CamelCase => MatchKind::CamelCase,
            RuleArg::CamelCaseSamePartCount => MatchKind::CamelCaseSamePartCount,
        };
        MatchRule::new(kind, case_sensitive)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = IndexConfig::load_or_default(cli.config.as_deref())?;
    let index = Index::open(&cli.index, cli.container.as_str(), &config, true)
        .with_context(|| format!("failed to open index {}", cli.index.display()))?;

    match cli.command {
        Commands::Ingest { file, absolute } => ingest(&index, &file, absolute)?,
        Commands::Query {
            categories,
            key,
            rule,
            case_sensitive,
            json,
        } => {
            let cats: Vec<&str> = categories.iter().map(String::as_str).collect();
            let hits = index.query(&cats, key.as_deref(), rule.to_rule(case_sensitive))?;
            if json {
                let mut out = Vec::with_capacity(hits.len());
                for hit in &hits {
                    out.push(serde_json::json!({
                        "key": hit.word(),
                        "documents": hit.document_names()?,
                    }));
                }
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for hit in &hits {
                    println!("{}", hit.word());
                    for doc in hit.document_names()? {
                        println!("  {}", doc);
                    }
                }
            }
        }
        Commands::Docs { substring } => match index.query_document_names(substring.as_deref())? {
            Some(names) => names.iter().for_each(|n| println!("{}", n)),
            None => println!("(no documents)"),
        },
        Commands::Stats => println!("{}", index.stats()),
    }

    Ok(())
}

fn ingest(index: &Index, file: &Path, absolute: bool) -> Result<()> {
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("failed to open {}", file.display()))?,
    );

    let document_name = |raw: &str, line_no: usize| -> Result<String> {
        if !absolute {
            return Ok(raw.to_string());
        }
        let inside = raw
            .strip_prefix(index.container_path())
            .and_then(|r| r.strip_prefix(index.separator()))
            .is_some_and(|r| !r.is_empty());
        if !inside && !raw.contains(symdex::core::ARCHIVE_ENTRY_SEPARATOR) {
            bail!(
                "line {}: {} is not inside container {}",
                line_no,
                raw,
                index.container_path()
            );
        }
        Ok(index.container_relative_path(raw))
    };

    let (mut added, mut removed) = (0usize, 0usize);
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = i + 1;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.as_slice() {
            ["-", doc] => {
                index.remove(&document_name(*doc, line_no)?);
                removed += 1;
            }
            [doc, category, key] => {
                index.add_index_entry(category, key, &document_name(*doc, line_no)?);
                added += 1;
            }
            _ => bail!("line {}: expected 3 tab-separated fields", line_no),
        }
    }

    index.save()?;
    info!("Ingested {} entries, {} removals", added, removed);
    Ok(())
}
