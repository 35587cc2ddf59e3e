use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tranche_core::net::dir::DirNetwork;
use tranche_core::report::Report;
use tranche_core::{Credentials, UploadConfig, UploadSession, ValidationError};

const EXIT_UPLOAD_FAILED: u8 = 1;
const EXIT_BAD_SOURCE: u8 = 2;
const EXIT_CREDENTIALS: u8 = 3;
const EXIT_NO_SERVERS: u8 = 4;

#[derive(Parser)]
#[command(name = "tranche", version, about = "Chunked, replicated data-set upload")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Upload a file or directory; prints the root hash
    Upload(UploadArgs),
    /// Print a persisted upload report as JSON
    Report { file: PathBuf },
}

#[derive(Args)]
struct UploadArgs {
    /// Network description (JSON list of directory-backed servers)
    #[arg(long)]
    network: PathBuf,
    /// File holding the 32-byte ed25519 signing seed as hex
    #[arg(long)]
    key: PathBuf,
    #[arg(long, default_value = "tranche")]
    user: String,
    /// Base configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    passphrase: Option<String>,
    #[arg(long, default_value_t = false)]
    compress: bool,
    #[arg(long, default_value_t = false)]
    expand_archives: bool,
    #[arg(long)]
    replication: Option<usize>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, default_value_t = false)]
    data_only: bool,
    #[arg(long)]
    sticky: Vec<String>,
    #[arg(long)]
    exclude: Vec<String>,
    /// License text uploaded with the data set
    #[arg(long)]
    license: Option<PathBuf>,
    /// Write the binary report here
    #[arg(long)]
    report: Option<PathBuf>,
    path: PathBuf,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.cmd {
        Cmd::Upload(args) => upload(args),
        Cmd::Report { file } => print_report(&file).map(|_| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_UPLOAD_FAILED)
        }
    }
}

fn build_config(args: &UploadArgs) -> Result<UploadConfig> {
    let mut cfg = match &args.config {
        Some(p) => UploadConfig::from_json_file(p)?,
        None => UploadConfig::default(),
    };
    cfg.source = args.path.clone();
    if let Some(t) = &args.title {
        cfg.title = t.clone();
    }
    if let Some(d) = &args.description {
        cfg.description = d.clone();
    }
    if args.passphrase.is_some() {
        cfg.passphrase = args.passphrase.clone();
    }
    cfg.compress |= args.compress;
    cfg.expand_archives |= args.expand_archives;
    cfg.data_only |= args.data_only;
    if let Some(n) = args.replication {
        cfg.replication_factor = n;
    }
    if let Some(n) = args.threads {
        cfg.threads = n;
    }
    cfg.sticky_servers.extend(args.sticky.iter().cloned());
    cfg.exclude.extend(args.exclude.iter().cloned());
    if let Some(p) = &args.license {
        cfg.license = Some(fs::read_to_string(p).with_context(|| format!("read license {:?}", p))?);
    }
    let seed = fs::read_to_string(&args.key).with_context(|| format!("read key {:?}", args.key))?;
    cfg.credentials = Some(Credentials::from_seed_hex(&args.user, &seed)?);
    Ok(cfg)
}

fn validation_exit(e: &ValidationError) -> u8 {
    match e {
        ValidationError::MissingSource(_)
        | ValidationError::EmptySource(_)
        | ValidationError::BadPattern(_)
        | ValidationError::Io(_) => EXIT_BAD_SOURCE,
        ValidationError::MissingCredentials | ValidationError::ExpiredCredentials(_) => {
            EXIT_CREDENTIALS
        }
        ValidationError::NoServersSelected | ValidationError::NoUsableServers => EXIT_NO_SERVERS,
        ValidationError::AlreadyStarted => EXIT_UPLOAD_FAILED,
    }
}

fn upload(args: UploadArgs) -> Result<ExitCode> {
    let net = Arc::new(DirNetwork::load(&args.network)?);
    let cfg = build_config(&args)?;
    let session = UploadSession::new(cfg, net.clone(), net);
    let report = match session.execute() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(ExitCode::from(validation_exit(&e)));
        }
    };
    if let Some(out) = &args.report {
        report.write_to(out)?;
    }
    match report.hash {
        Some(h) => {
            println!("{}", h);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            for f in &report.failures {
                eprintln!("failed: {}: {}", f.file.as_deref().unwrap_or("-"), f.message);
            }
            Ok(ExitCode::from(EXIT_UPLOAD_FAILED))
        }
    }
}

fn print_report(path: &Path) -> Result<()> {
    let report = Report::read_from(path)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
