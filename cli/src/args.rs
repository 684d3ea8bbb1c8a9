use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf};

use clap::{Parser, ValueHint};

/// Converts a compartment report into the sharded container format.
#[derive(Debug, Parser)]
#[command(name = "compartment-converter", disable_version_flag = true)]
pub struct Cli {
    /// Report to convert
    #[arg(
        short,
        long,
        value_hint = ValueHint::FilePath,
        required_unless_present = "version"
    )]
    pub input: Option<String>,

    /// Converted report
    #[arg(
        short,
        long,
        default_value = "out.h5",
        value_hint = ValueHint::AnyPath
    )]
    pub output: String,

    /// Convert at most this many frames
    #[arg(short = 'm', long = "maxFrames", value_name = "N")]
    pub max_frames: Option<u64>,

    /// Verify the output against the input
    #[arg(short, long)]
    pub compare: bool,

    /// Print the input metadata and exit
    #[arg(short, long)]
    pub dump: bool,

    /// Print the version and exit
    #[arg(short = 'v', long)]
    pub version: bool,

    /// Run this many ranks as threads of this process
    #[arg(
        long,
        env = "COMPARTMENT_LOCAL_RANKS",
        value_name = "N",
        conflicts_with = "rank"
    )]
    pub local_ranks: Option<NonZeroUsize>,

    /// Rank of this process in a multi-process run
    #[arg(
        long,
        env = "COMPARTMENT_RANK",
        requires_all = ["world_size", "coordinator"]
    )]
    pub rank: Option<usize>,

    /// Number of processes in the run
    #[arg(
        long,
        env = "COMPARTMENT_WORLD_SIZE",
        value_name = "N",
        requires = "rank"
    )]
    pub world_size: Option<usize>,

    /// Address rank 0 listens on
    #[arg(long, env = "COMPARTMENT_COORDINATOR", value_name = "ADDR")]
    pub coordinator: Option<SocketAddr>,

    /// Certificate file rank 0 publishes [default: <output>.fabric]
    #[arg(
        long,
        env = "COMPARTMENT_RENDEZVOUS",
        value_hint = ValueHint::FilePath
    )]
    pub rendezvous: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ranks {
    /// Threads of this process over a local fabric.
    Local(usize),
    /// One process of a run over QUIC links.
    Remote {
        rank: usize,
        world: usize,
        coordinator: SocketAddr,
        rendezvous: PathBuf,
    },
}

impl Cli {
    /// How the ranks of this run are laid out.
    pub fn ranks(&self) -> Ranks {
        match (self.rank, self.world_size, self.coordinator) {
            (Some(rank), Some(world), Some(coordinator)) => Ranks::Remote {
                rank,
                world,
                coordinator,
                rendezvous: self.rendezvous.clone().unwrap_or_else(|| {
                    PathBuf::from(format!("{}.fabric", self.output))
                }),
            },
            _ => Ranks::Local(self.local_ranks.map_or(1, NonZeroUsize::get)),
        }
    }
}
