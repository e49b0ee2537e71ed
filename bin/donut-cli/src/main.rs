//! Donut CLI - Admin Command Line Interface
//!
//! This binary drives a donut storage domain declared in a TOML settings
//! file: bucket and object operations plus topology management.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use donut_common::{Metadata, Settings};
use donut_core::{Donut, Management, ObjectStorage};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "donut-cli")]
#[command(about = "Donut storage domain admin CLI")]
#[command(version)]
struct Args {
    /// Settings file declaring the domain
    #[arg(short, long, env = "DONUT_CONFIG", default_value = "donut.toml")]
    config: PathBuf,

    /// Log level (defaults to the level in the settings file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the domain directories and persist its configuration
    Init,
    /// Show nodes and disks
    Info {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Persist the current topology on every disk
    SaveConfig,
    /// Create a bucket
    MakeBucket {
        bucket: String,
        /// Canned ACL: private, public-read, public-read-write, authenticated-read
        #[arg(long, default_value = "private")]
        acl: String,
    },
    /// List buckets
    ListBuckets,
    /// List objects in a bucket
    ListObjects {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, default_value = "")]
        marker: String,
        #[arg(long, default_value = "")]
        delimiter: String,
        #[arg(long, default_value_t = 1000)]
        max_keys: usize,
    },
    /// Upload a file ("-" reads stdin)
    Put {
        bucket: String,
        key: String,
        file: PathBuf,
        /// Expected MD5 (hex or base64)
        #[arg(long, default_value = "")]
        md5: String,
        #[arg(long)]
        content_type: Option<String>,
        /// Extra metadata as key=value
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },
    /// Download an object (to stdout unless --output is given)
    Get {
        bucket: String,
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show object metadata
    Stat { bucket: String, key: String },
    /// Delete an object
    Rm { bucket: String, key: String },
    /// Repair missing or damaged replicas
    Heal,
    /// Copy objects onto every attached disk
    Rebalance,
}

/// Parse a `key=value` metadata pair
fn parse_meta(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid metadata '{s}', expected key=value"))?;
    if key.is_empty() {
        bail!("Invalid metadata '{s}', key is empty");
    }
    Ok((key.to_string(), value.to_string()))
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if settings.nodes.is_empty() {
        bail!("{} declares no nodes", path.display());
    }
    Ok(settings)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_metadata(metadata: &Metadata) {
    let width = metadata.keys().map(String::len).max().unwrap_or(0);
    for (key, value) in metadata {
        println!("  {key:<width$}  {value}");
    }
}

fn run(command: Commands, donut: &Donut) -> Result<()> {
    match command {
        Commands::Init => {
            donut.save_config()?;
            println!("Initialized domain {}", donut.name());
            print_topology(donut, false)?;
        }
        Commands::Info { json } => print_topology(donut, json)?,
        Commands::SaveConfig => {
            donut.save_config()?;
            println!("Saved configuration of {}", donut.name());
        }
        Commands::MakeBucket { bucket, acl } => {
            donut.make_bucket(&bucket, &acl)?;
            println!("Created bucket {bucket}");
        }
        Commands::ListBuckets => {
            let buckets = donut.list_buckets()?;
            println!("{:<40} {:<20} CREATED", "BUCKET", "ACL");
            println!("{}", "-".repeat(100));
            for (name, metadata) in &buckets {
                println!(
                    "{:<40} {:<20} {}",
                    name,
                    metadata.get("acl").map_or("private", String::as_str),
                    metadata.get("created").map_or("", String::as_str)
                );
            }
            println!("\nTotal: {} buckets", buckets.len());
        }
        Commands::ListObjects {
            bucket,
            prefix,
            marker,
            delimiter,
            max_keys,
        } => {
            let page = donut.list_objects(&bucket, &prefix, &marker, &delimiter, max_keys)?;
            for common_prefix in &page.common_prefixes {
                println!("{:>12}  {}", "PRE", common_prefix);
            }
            for key in &page.objects {
                let metadata = donut.get_object_metadata(&bucket, key)?;
                let size = metadata
                    .get("size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                println!("{:>12}  {}", format_size(size), key);
            }
            if page.is_truncated {
                let next = page
                    .objects
                    .last()
                    .into_iter()
                    .chain(page.common_prefixes.last())
                    .max()
                    .map_or("", String::as_str);
                println!("(truncated, continue with --marker '{next}')");
            }
        }
        Commands::Put {
            bucket,
            key,
            file,
            md5,
            content_type,
            meta,
        } => {
            let mut metadata: Metadata = meta.into_iter().collect();
            if let Some(content_type) = content_type {
                metadata.insert("contentType".to_string(), content_type);
            }
            let mut reader: Box<dyn Read> = if file.as_os_str() == "-" {
                Box::new(io::stdin().lock())
            } else {
                Box::new(
                    File::open(&file)
                        .with_context(|| format!("Failed to open {}", file.display()))?,
                )
            };
            let digest = donut.put_object(&bucket, &key, &md5, &mut reader, &metadata)?;
            println!("Stored {bucket}/{key} (md5 {digest})");
        }
        Commands::Get {
            bucket,
            key,
            output,
        } => {
            let (mut reader, size) = donut.get_object(&bucket, &key)?;
            let written = match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    io::copy(&mut reader, &mut file)?
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    let written = io::copy(&mut reader, &mut stdout)?;
                    stdout.flush()?;
                    written
                }
            };
            if written != size {
                bail!("Read {written} bytes of {bucket}/{key}, expected {size}");
            }
            info!("Fetched {}/{} ({} bytes)", bucket, key, written);
        }
        Commands::Stat { bucket, key } => {
            println!("Object: {bucket}/{key}");
            print_metadata(&donut.get_object_metadata(&bucket, &key)?);
            println!("Placement:");
            print_metadata(&donut.get_donut_object_metadata(&bucket, &key)?);
        }
        Commands::Rm { bucket, key } => {
            donut.delete_object(&bucket, &key)?;
            println!("Deleted {bucket}/{key}");
        }
        Commands::Heal => print_json(&donut.heal()?)?,
        Commands::Rebalance => print_json(&donut.rebalance()?)?,
    }
    Ok(())
}

fn print_topology(donut: &Donut, json: bool) -> Result<()> {
    let info = donut.info()?;
    if json {
        return print_json(&info);
    }

    println!("Domain: {}", donut.name());
    println!(
        "{:<16} {:<6} {:<48} {:>12} {:>8}",
        "NODE", "ORDER", "PATH", "WRITTEN", "ERRORS"
    );
    println!("{}", "-".repeat(94));
    for (node, disks) in &info {
        for disk in disks {
            println!(
                "{:<16} {:<6} {:<48} {:>12} {:>8}",
                node,
                disk.order,
                disk.path,
                format_size(disk.stats.bytes_written),
                disk.stats.errors
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let settings = load_settings(&args.config)?;

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let donut = Donut::from_settings(&settings)
        .with_context(|| format!("Failed to open domain {}", settings.domain.name))?;
    run(args.command, &donut)
}
