#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use fsim::{FtlCore, ModelPhy, PhyTiming, SimConfig, StreamId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::env;
use std::fs;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workload {
    Sequential,
    Random,
}

struct RunArgs {
    config_path: Option<String>,
    workload: Workload,
    ops: u64,
    fill_ratio: f64,
    rewrite_ratio: f64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "run" => {
            let parsed = parse_run_args(args)?;
            run_workload(&parsed)
        }
        "default-config" => {
            let json = serde_json::to_string_pretty(&SimConfig::default())
                .context("serializing the default configuration")?;
            println!("{json}");
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("fsim-cli\n");
    println!("USAGE:");
    println!("  fsim-cli run [config.json] [--workload sequential|random] [--ops N]");
    println!("               [--fill RATIO] [--rewrite RATIO]");
    println!("  fsim-cli default-config");
}

fn parse_run_args(mut args: impl Iterator<Item = String>) -> Result<RunArgs> {
    let mut parsed = RunArgs {
        config_path: None,
        workload: Workload::Sequential,
        ops: 1024,
        fill_ratio: 0.0,
        rewrite_ratio: 0.0,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--workload" => {
                parsed.workload = match args.next().as_deref() {
                    Some("sequential") => Workload::Sequential,
                    Some("random") => Workload::Random,
                    other => bail!("--workload expects sequential|random, got {other:?}"),
                };
            }
            "--ops" => {
                let value = args.next().context("--ops requires a value")?;
                parsed.ops = value.parse().with_context(|| format!("invalid --ops {value}"))?;
            }
            "--fill" => {
                let value = args.next().context("--fill requires a value")?;
                parsed.fill_ratio =
                    value.parse().with_context(|| format!("invalid --fill {value}"))?;
            }
            "--rewrite" => {
                let value = args.next().context("--rewrite requires a value")?;
                parsed.rewrite_ratio = value
                    .parse()
                    .with_context(|| format!("invalid --rewrite {value}"))?;
            }
            path if parsed.config_path.is_none() && !path.starts_with('-') => {
                parsed.config_path = Some(path.to_owned());
            }
            other => bail!("unexpected argument: {other}"),
        }
    }
    Ok(parsed)
}

fn run_workload(args: &RunArgs) -> Result<()> {
    let config = match &args.config_path {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading configuration {path}"))?;
            SimConfig::from_json_str(&json).with_context(|| format!("parsing {path}"))?
        }
        None => SimConfig::default(),
    };
    let geometry = config.device.geometry();
    let phy = ModelPhy::new(geometry, PhyTiming::default());
    let mut core = FtlCore::new(config.clone(), phy).context("constructing the FTL core")?;

    if args.fill_ratio > 0.0 {
        core.precondition(args.fill_ratio, args.rewrite_ratio)
            .context("preconditioning")?;
    }

    let sectors_per_page = geometry.sectors_per_page;
    let logical_sectors = config.logical_pages_per_stream() * u64::from(sectors_per_page);
    let streams = config.ftl.stream_count;
    let mut rng = SmallRng::seed_from_u64(config.ftl.seed);

    info!(
        target: "fsim::cli",
        workload = ?args.workload,
        ops = args.ops,
        streams,
        "workload start"
    );
    for op in 0..args.ops {
        let stream = StreamId((op % u64::from(streams)) as u8);
        match args.workload {
            Workload::Sequential => {
                let lha = (op * u64::from(sectors_per_page)) % logical_sectors;
                core.submit_user_write(stream, lha, sectors_per_page)?;
            }
            Workload::Random => {
                let page = rng.gen_range(0..logical_sectors / u64::from(sectors_per_page));
                let lha = page * u64::from(sectors_per_page);
                if rng.gen_bool(0.5) {
                    core.submit_user_write(stream, lha, sectors_per_page)?;
                } else {
                    core.submit_user_read(stream, lha, sectors_per_page)?;
                }
            }
        }
        core.run_until_quiescent()?;
    }
    core.check_consistency().context("post-run consistency check")?;

    println!("{}", core.report());
    Ok(())
}
