use std::time::{Duration, Instant};

use tracing::trace;

use super::{Error, Result};
use crate::report::{self, ReportReader, ReportWriter, OFFSET_SENTINEL};

/// Converts single frames: regroups the flat input frame into per-neuron
/// slices and writes every slice.
///
/// Only the rank that was assigned a frame converts it, so the slices of
/// neurons whose counts another rank committed are written here as well.
pub struct FrameWorker<'a> {
    reader: &'a dyn ReportReader,
    writer: &'a mut dyn ReportWriter,
    slice: Vec<f32>,
    read_time: Duration,
    write_time: Duration,
}

impl<'a> FrameWorker<'a> {
    pub fn new(
        reader: &'a dyn ReportReader,
        writer: &'a mut dyn ReportWriter,
    ) -> Self {
        Self {
            slice: Vec::with_capacity(reader.layout().max_compartments()),
            reader,
            writer,
            read_time: Duration::ZERO,
            write_time: Duration::ZERO,
        }
    }

    pub fn process(&mut self, index: u64) -> Result<()> {
        let reader = self.reader;
        let timestamp = reader.metadata().frame_time(index);

        let started = Instant::now();
        let frame = reader
            .load_frame(timestamp)?
            .ok_or(Error::MissingFrame { index, timestamp })?;
        self.read_time += started.elapsed();

        let started = Instant::now();
        let layout = reader.layout();
        for (i, &gid) in layout.gids.iter().enumerate() {
            self.slice.clear();
            let sections = layout.offsets[i].iter().zip(&layout.counts[i]);
            for (&offset, &count) in sections {
                if offset == OFFSET_SENTINEL {
                    continue;
                }
                let start = offset as usize;
                let section = frame
                    .get(start..start + usize::from(count))
                    .ok_or_else(|| {
                        report::Error::layout(gid, "section outside the frame")
                    })?;
                self.slice.extend_from_slice(section);
            }
            self.writer.write_frame(gid, &self.slice, timestamp)?;
        }
        self.write_time += started.elapsed();
        trace!(index, timestamp, "frame converted");
        Ok(())
    }

    /// Accumulated time spent loading and writing frames.
    pub fn timings(&self) -> (Duration, Duration) {
        (self.read_time, self.write_time)
    }
}
