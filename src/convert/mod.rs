//! The conversion pipeline run by every rank.
//!
//! Each rank opens the input, writes the (possibly clamped) header and the
//! full layout to its own writer, committing compartment counts only for
//! the neurons it owns. It then converts every neuron of the frames the
//! [`Dispatcher`] assigns to it and flushes. Rank 0 optionally verifies the
//! result.

use std::{
    fmt, io,
    time::{Duration, Instant},
};

use tracing::{debug, info, info_span};
use typed_builder::TypedBuilder;

use crate::{
    fabric::Fabric,
    report::{self, ReportReader, WriterOptions},
};

mod dispatch;
mod error;
mod frame;
mod partition;
mod verify;

pub use dispatch::{prequeue_depth, Dispatcher, Settlement};
pub use error::{Error, Result};
pub use frame::FrameWorker;
pub use partition::{declare_layout, owned_range};
pub use verify::verify;

#[derive(Debug, Clone, TypedBuilder)]
pub struct ConvertConfig {
    #[builder(setter(into))]
    pub input: String,
    #[builder(default = "out.h5".to_string(), setter(into))]
    pub output: String,
    /// Convert at most this many frames.
    #[builder(default, setter(strip_option))]
    pub max_frames: Option<u64>,
    /// Verify the output against the input once every rank is done.
    #[builder(default = false)]
    pub compare: bool,
    #[builder(default = true)]
    pub overwrite: bool,
}

/// What one rank did during a conversion.
#[derive(Debug, Clone)]
pub struct ConversionSummary {
    pub input: String,
    pub output: String,
    pub rank: usize,
    pub world: usize,
    pub frames: u64,
    pub total: Duration,
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

impl fmt::Display for ConversionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Converted {} -> {} in {}ms (r {} w {} i {})",
            self.input,
            self.output,
            self.total.as_millis(),
            self.read.as_millis(),
            self.write.as_millis(),
            self.idle.as_millis()
        )?;
        if self.world > 1 {
            write!(
                f,
                " proc {}/{} done {} frames",
                self.rank, self.world, self.frames
            )?;
        }
        Ok(())
    }
}

/// Converts `config.input` into `config.output` as rank `fabric.rank()`.
///
/// Every rank of `fabric` must call this with the same configuration.
pub fn convert<F: Fabric + ?Sized>(
    config: &ConvertConfig,
    fabric: &F,
) -> Result<ConversionSummary> {
    let span =
        info_span!("convert", rank = fabric.rank(), world = fabric.size());
    let _entered = span.enter();
    let started = Instant::now();

    let reader = report::open_reader(&config.input)?;
    let opened = started.elapsed();
    let metadata = reader.metadata().clamped(config.max_frames);
    let frames = metadata.frame_count();
    // before the output exists, so a refused run leaves nothing behind
    let dispatcher = Dispatcher::new(fabric, frames)?;

    let options = WriterOptions::builder()
        .overwrite(config.overwrite)
        .rank(fabric.rank())
        .world(fabric.size())
        .build();
    let mut writer = report::open_writer(&config.output, &options)?;
    writer.write_header(&metadata)?;
    let owned =
        owned_range(reader.layout().len(), fabric.rank(), fabric.size());
    declare_layout(writer.as_mut(), reader.layout(), owned.clone())?;
    debug!(frames, owned = ?owned, "header and layout written");

    let mut worker = FrameWorker::new(reader.as_ref(), writer.as_mut());
    let settlement = dispatcher.dispatch(|index| worker.process(index))?;
    let (read, mut write) = worker.timings();

    let flushing = Instant::now();
    writer.flush()?;
    write += flushing.elapsed();
    let local_frames = settlement.local_frames();
    let idle = settlement.settle()?;

    let summary = ConversionSummary {
        input: config.input.clone(),
        output: config.output.clone(),
        rank: fabric.rank(),
        world: fabric.size(),
        frames: local_frames,
        total: started.elapsed(),
        read: read + opened,
        write,
        idle,
    };
    info!(frames = local_frames, "conversion finished");

    if config.compare && fabric.is_coordinator() {
        let output = report::open_reader(&config.output)?;
        verify(reader.as_ref(), output.as_ref(), &metadata, frames)?;
    }
    Ok(summary)
}

/// Writes the metadata summary printed by `--dump`.
pub fn dump(
    uri: &str,
    reader: &dyn ReportReader,
    out: &mut impl io::Write,
) -> io::Result<()> {
    writeln!(out, "Compartment report {}:", uri)?;
    writeln!(
        out,
        "  Time: {}..{} / {} {}",
        reader.start(),
        reader.end(),
        reader.step(),
        reader.time_unit()
    )?;
    writeln!(out, "  {} neurons", reader.gids().len())?;
    writeln!(out, "  {} compartments", reader.frame_size())
}

#[cfg(test)]
mod tests;
