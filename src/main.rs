use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use coffer::config::Config;
use coffer::index::build_index;
use coffer::keys::generate_keys;
use coffer::repo::{open_repository, parse_url, RepoUrl, Repository};
use coffer::save::{save, SaveOptions};
use coffer::split::{split, SplitOptions};

const EXIT_OK: u8 = 0;
const EXIT_ERRORS: u8 = 1;
const EXIT_MISUSE: u8 = 97;
const EXIT_SIGNAL: u8 = 99;

#[derive(Parser)]
#[command(name = "coffer", about = "Incremental encrypted backups", version)]
struct Cli {
    /// Repository URL, e.g. config:///path/to/repo.conf
    #[arg(short = 'r', long = "repo", global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new encrypted repository and write its config file
    Init {
        /// Path of the config file to create
        conf: PathBuf,
        /// Storage directory for packs, indexes and refs
        #[arg(long)]
        storage: PathBuf,
        /// Local cache directory for decrypted indexes
        #[arg(long)]
        cache: PathBuf,
        /// Store metadata objects in their own packs
        #[arg(long)]
        separate_meta: bool,
        /// Store large directories as split trees
        #[arg(long)]
        tree_split: bool,
    },
    /// Save directory trees as a snapshot
    Save {
        /// Name of the branch to update
        #[arg(short, long)]
        name: Option<String>,
        /// Print the tree id
        #[arg(short = 't', long)]
        tree: bool,
        /// Print the commit id
        #[arg(short = 'c', long)]
        commit: bool,
        /// Strip the given source paths from archive names
        #[arg(long)]
        strip: bool,
        /// Strip this path prefix from archive names
        #[arg(long)]
        strip_path: Option<String>,
        /// Graft a path: old_path=new_path (repeatable)
        #[arg(long = "graft")]
        grafts: Vec<String>,
        /// Commit date, seconds since the epoch
        #[arg(short = 'd', long)]
        date: Option<i64>,
        /// Only back up files smaller than n bytes
        #[arg(long)]
        smaller: Option<u64>,
        paths: Vec<PathBuf>,
    },
    /// Split input files (or stdin) into the repository
    Split {
        /// Name of the branch to update
        #[arg(short, long)]
        name: Option<String>,
        /// Print the tree id
        #[arg(short = 't', long)]
        tree: bool,
        /// Print the commit id
        #[arg(short = 'c', long)]
        commit: bool,
        /// Force a chunk boundary at every input file boundary
        #[arg(long)]
        keep_boundaries: bool,
        files: Vec<PathBuf>,
    },
    /// List refs
    Refs {
        /// Limit to branch heads
        #[arg(long)]
        heads: bool,
        /// Limit to tags
        #[arg(long)]
        tags: bool,
        patterns: Vec<String>,
    },
    /// Write an object's payload to stdout
    Cat {
        /// A 40-digit hex object id or a ref name
        reference: String,
    },
    /// Print a repository configuration value
    Config {
        /// Key, e.g. bup.treesplit
        key: String,
    },
}

fn misuse(message: &str) -> ExitCode {
    eprintln!("error: {message}");
    ExitCode::from(EXIT_MISUSE)
}

async fn open_from_arg(repo: &Option<String>) -> anyhow::Result<Repository> {
    let url = repo
        .as_deref()
        .context("a repository is required (-r config:///path/to/repo.conf)")?;
    open_repository(url, false).await.map_err(Into::into)
}

fn cmd_init(
    conf: &PathBuf,
    storage: &PathBuf,
    cache: &PathBuf,
    separate_meta: bool,
    tree_split: bool,
) -> anyhow::Result<()> {
    if conf.exists() {
        bail!("{} already exists", conf.display());
    }
    let keys = generate_keys()?;
    let mut text = String::new();
    text.push_str("[bup]\n");
    text.push_str("\ttype = Encrypted\n");
    text.push_str("\tstorage = file\n");
    text.push_str(&format!("\tpath = {}\n", storage.display()));
    text.push_str(&format!("\tcachedir = {}\n", cache.display()));
    text.push_str(&format!("\trepokey = {}\n", keys.repokey));
    text.push_str(&format!("\twritekey = {}\n", keys.writekey));
    text.push_str(&format!("\treadkey = {}\n", keys.readkey));
    if separate_meta {
        text.push_str("\tseparatemeta = true\n");
    }
    if tree_split {
        text.push_str("\ttreesplit = true\n");
    }
    std::fs::create_dir_all(storage)?;
    std::fs::create_dir_all(cache)?;
    std::fs::write(conf, text)?;
    println!("repository config written to {}", conf.display());
    println!("keep this file safe: without its keys the backups are unreadable");
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Init {
            conf,
            storage,
            cache,
            separate_meta,
            tree_split,
        } => {
            cmd_init(&conf, &storage, &cache, separate_meta, tree_split)?;
            // open once so the storage layout exists up front
            let url = format!("config://{}", conf.display());
            let mut repo = open_repository(&url, true).await?;
            repo.close().await?;
            Ok(ExitCode::from(EXIT_OK))
        }

        Command::Save {
            name,
            tree,
            commit,
            strip,
            strip_path,
            grafts,
            date,
            smaller,
            paths,
        } => {
            if name.is_none() && !tree && !commit {
                return Ok(misuse("use one or more of -t, -c, -n"));
            }
            if paths.is_empty() {
                return Ok(misuse("no paths given"));
            }
            if strip && strip_path.is_some() {
                return Ok(misuse("--strip is incompatible with --strip-path"));
            }
            if (strip || strip_path.is_some()) && !grafts.is_empty() {
                return Ok(misuse("--graft is incompatible with --strip and --strip-path"));
            }
            let mut graft_points = Vec::new();
            for graft in &grafts {
                let Some((old, new)) = graft.split_once('=') else {
                    return Ok(misuse("a graft point must be of the form old_path=new_path"));
                };
                if old.is_empty() || new.is_empty() {
                    return Ok(misuse("a graft point cannot be empty"));
                }
                graft_points.push((old.as_bytes().to_vec(), new.as_bytes().to_vec()));
            }

            let mut repo = open_from_arg(&cli.repo).await?;
            let mut sources = Vec::with_capacity(paths.len());
            for path in &paths {
                sources.push(
                    std::fs::canonicalize(path)
                        .with_context(|| format!("cannot resolve {}", path.display()))?,
                );
            }
            let (mut index, hlinks) = build_index(&sources)?;
            let opts = SaveOptions {
                name,
                commit,
                strip,
                strip_path: strip_path.map(String::into_bytes),
                grafts: graft_points,
                smaller,
                date,
                message: Some(format!(
                    "coffer save\n\nGenerated by command:\n{:?}\n",
                    std::env::args().collect::<Vec<_>>()
                )),
                ..Default::default()
            };

            let result = tokio::select! {
                result = save(&mut repo, &mut index, &hlinks, &sources, &opts) => Some(result),
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(result) = result else {
                repo.abort_writing().await;
                eprintln!("interrupted");
                return Ok(ExitCode::from(EXIT_SIGNAL));
            };
            let outcome = result?;
            if tree {
                println!("{}", hex::encode(outcome.tree));
            }
            if commit {
                if let Some(commit) = outcome.commit {
                    println!("{}", hex::encode(commit));
                }
            }
            repo.close().await?;
            if outcome.errors.is_empty() {
                Ok(ExitCode::from(EXIT_OK))
            } else {
                eprintln!("WARNING: {} errors encountered while saving", outcome.errors.len());
                Ok(ExitCode::from(EXIT_ERRORS))
            }
        }

        Command::Split {
            name,
            tree,
            commit,
            keep_boundaries,
            files,
        } => {
            if name.is_none() && !tree && !commit {
                return Ok(misuse("use one or more of -t, -c, -n"));
            }
            let mut repo = open_from_arg(&cli.repo).await?;
            let mut sources: Vec<Box<dyn std::io::Read>> = Vec::new();
            if files.is_empty() {
                sources.push(Box::new(std::io::stdin()));
            } else {
                for file in &files {
                    sources.push(Box::new(std::fs::File::open(file).with_context(|| {
                        format!("cannot open {}", file.display())
                    })?));
                }
            }
            let opts = SplitOptions {
                name,
                commit,
                keep_boundaries,
                message: Some(format!(
                    "coffer split\n\nGenerated by command:\n{:?}\n",
                    std::env::args().collect::<Vec<_>>()
                )),
                ..Default::default()
            };
            let result = tokio::select! {
                result = split(&mut repo, sources, &opts) => Some(result),
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(result) = result else {
                repo.abort_writing().await;
                eprintln!("interrupted");
                return Ok(ExitCode::from(EXIT_SIGNAL));
            };
            let outcome = result?;
            if tree {
                println!("{}", hex::encode(outcome.tree));
            }
            if commit {
                if let Some(commit) = outcome.commit {
                    println!("{}", hex::encode(commit));
                }
            }
            repo.close().await?;
            Ok(ExitCode::from(EXIT_OK))
        }

        Command::Refs {
            heads,
            tags,
            patterns,
        } => {
            let repo = open_from_arg(&cli.repo).await?;
            let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
            for (name, oid) in repo.refs(&patterns, heads, tags).await? {
                println!("{} {name}", hex::encode(oid));
            }
            Ok(ExitCode::from(EXIT_OK))
        }

        Command::Cat { reference } => {
            let mut repo = open_from_arg(&cli.repo).await?;
            match repo.cat(&reference).await? {
                Some((oidx, objtype, data)) => {
                    log::info!("{oidx} {} {}", objtype.name(), data.len());
                    std::io::stdout().write_all(&data)?;
                    Ok(ExitCode::from(EXIT_OK))
                }
                None => {
                    eprintln!("error: object not found: {reference}");
                    Ok(ExitCode::from(EXIT_ERRORS))
                }
            }
        }

        Command::Config { key } => {
            let url = cli
                .repo
                .as_deref()
                .context("a repository is required (-r config:///path/to/repo.conf)")?;
            let RepoUrl::Config(path) = parse_url(url) else {
                bail!("the config command needs a config:// repository");
            };
            let config = Config::load(&path)?;
            match config.get(&key) {
                Some(value) => {
                    println!("{value}");
                    Ok(ExitCode::from(EXIT_OK))
                }
                None => Ok(ExitCode::from(EXIT_ERRORS)),
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_ERRORS)
        }
    }
}
