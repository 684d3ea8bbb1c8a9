use std::{io, process::ExitCode, thread};

use clap::{error::ErrorKind, CommandFactory, Parser};
use compartment_report::{
    convert::{self, ConversionSummary, ConvertConfig},
    fabric::{FabricError, LocalFabric, QuicConfig, QuicFabric},
    report,
};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod args;

use args::{Cli, Ranks};

#[derive(Debug, Error)]
enum Failure {
    #[error(transparent)]
    Convert(#[from] convert::Error),
    #[error(transparent)]
    Report(#[from] report::Error),
    #[error(transparent)]
    Transport(#[from] FabricError),
    #[error("failed to write to stdout: {0}")]
    Stdout(#[from] io::Error),
    #[error("rank {0} panicked")]
    Panicked(usize),
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayHelp => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            eprintln!("\n{}", Cli::command().render_help());
            return ExitCode::FAILURE;
        }
    };
    if cli.version {
        let version = env!("CARGO_PKG_VERSION");
        println!("Compartment report converter {}", version);
        return ExitCode::SUCCESS;
    }
    init_logging();

    match run(&cli) {
        Ok(summaries) => {
            for summary in summaries {
                println!("{}", summary);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so the report printed by `--dump` stays clean.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Dumps or converts the input, returning the summary of every rank run
/// by this process.
fn run(cli: &Cli) -> Result<Vec<ConversionSummary>, Failure> {
    // clap only lets a missing input through together with --version
    let input = cli.input.clone().unwrap_or_default();
    if cli.dump {
        let reader = report::open_reader(&input)?;
        convert::dump(&input, reader.as_ref(), &mut io::stdout().lock())?;
        return Ok(Vec::new());
    }

    let mut config = ConvertConfig::builder()
        .input(input)
        .output(cli.output.clone())
        .compare(cli.compare)
        .build();
    config.max_frames = cli.max_frames;

    match cli.ranks() {
        Ranks::Local(size) => run_local(&config, size),
        Ranks::Remote {
            rank,
            world,
            coordinator,
            rendezvous,
        } => {
            let fabric = QuicFabric::connect(
                &QuicConfig::builder()
                    .rank(rank)
                    .world(world)
                    .coordinator(coordinator)
                    .rendezvous(rendezvous)
                    .build(),
            )?;
            debug!(rank, world, %coordinator, "fabric connected");
            let summary = convert::convert(&config, &fabric)?;
            Ok(vec![summary])
        }
    }
}

/// Runs every rank of a world of `size` on its own thread and returns the
/// summaries in rank order, or the error of the lowest failing rank.
fn run_local(
    config: &ConvertConfig,
    size: usize,
) -> Result<Vec<ConversionSummary>, Failure> {
    let ranks: Vec<_> = LocalFabric::world(size)
        .into_iter()
        .map(|fabric| {
            let config = config.clone();
            thread::spawn(move || convert::convert(&config, &fabric))
        })
        .collect();

    let mut summaries = Vec::with_capacity(ranks.len());
    let mut failure = None;
    for (rank, handle) in ranks.into_iter().enumerate() {
        let outcome = match handle.join() {
            Ok(result) => result.map_err(Failure::from),
            Err(_) => Err(Failure::Panicked(rank)),
        };
        match outcome {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}
