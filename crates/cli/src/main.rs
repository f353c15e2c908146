use std::net::SocketAddr;
use std::path::PathBuf;

use spillway_common::SpillConfig;
use spillway_spill::paths::cleanup_stale_spill_files;
use tracing_subscriber::EnvFilter;

mod bench;
mod inspect;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match args.first().map(|a| a.as_str()) {
        None | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("inspect") => inspect::run(parse_inspect_opts(&args)?),
        Some("config") => {
            let config = load_config(parse_config_path(&args)?)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some("cleanup") => {
            let config = load_config(parse_config_path(&args)?)?;
            for dir in &config.spill_paths {
                let removed = cleanup_stale_spill_files(dir);
                println!("{}: removed {removed} stale spill file(s)", dir.display());
            }
            Ok(())
        }
        Some("bench") => bench::run(parse_bench_opts(&args)?).await,
        Some(other) => Err(format!("unknown command: {other}").into()),
    }
}

/// Config from `--config PATH` when given, otherwise defaults plus
/// `SPILLWAY_*` environment overrides.
fn load_config(path: Option<PathBuf>) -> CliResult<SpillConfig> {
    Ok(match path {
        Some(path) => SpillConfig::load(path)?,
        None => SpillConfig::from_env()?,
    })
}

#[derive(Debug, Clone)]
pub(crate) struct InspectOpts {
    pub file: PathBuf,
    pub verify: bool,
    pub types: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub(crate) struct BenchOpts {
    pub config: Option<PathBuf>,
    pub batches: usize,
    pub rows: usize,
    pub metrics_addr: Option<SocketAddr>,
}

fn parse_inspect_opts(args: &[String]) -> CliResult<InspectOpts> {
    let mut file = None;
    let mut verify = false;
    let mut types = None;
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--verify" => verify = true,
            "--types" => {
                i += 1;
                let raw = args.get(i).cloned().ok_or("missing value for --types")?;
                types = Some(
                    raw.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect(),
                );
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument for inspect: {other}").into());
            }
            path => {
                if file.is_some() {
                    return Err(format!("unexpected extra argument: {path}").into());
                }
                file = Some(PathBuf::from(path));
            }
        }
        i += 1;
    }
    Ok(InspectOpts {
        file: file.ok_or("inspect requires a spill file path")?,
        verify,
        types,
    })
}

fn parse_config_path(args: &[String]) -> CliResult<Option<PathBuf>> {
    let mut config = None;
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i).cloned().ok_or("missing value for --config")?,
                ));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
        i += 1;
    }
    Ok(config)
}

fn parse_bench_opts(args: &[String]) -> CliResult<BenchOpts> {
    let mut opts = BenchOpts {
        config: None,
        batches: 64,
        rows: 4096,
        metrics_addr: None,
    };
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                opts.config = Some(PathBuf::from(
                    args.get(i).cloned().ok_or("missing value for --config")?,
                ));
            }
            "--batches" => {
                i += 1;
                opts.batches = args
                    .get(i)
                    .ok_or("missing value for --batches")?
                    .parse()?;
            }
            "--rows" => {
                i += 1;
                opts.rows = args.get(i).ok_or("missing value for --rows")?.parse()?;
            }
            "--metrics-addr" => {
                i += 1;
                opts.metrics_addr = Some(
                    args.get(i)
                        .ok_or("missing value for --metrics-addr")?
                        .parse()?,
                );
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument for bench: {other}").into()),
        }
        i += 1;
    }
    if opts.rows == 0 {
        return Err("--rows must be at least 1".into());
    }
    Ok(opts)
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  spillway inspect FILE [--verify] [--types int64,utf8,...]");
    eprintln!("  spillway config [--config PATH]");
    eprintln!("  spillway cleanup [--config PATH]");
    eprintln!("  spillway bench [--config PATH] [--batches N] [--rows N] [--metrics-addr ADDR]");
}
