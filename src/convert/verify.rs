use tracing::debug;

use super::{Error, Result};
use crate::report::{ReportMetadata, ReportReader, OFFSET_SENTINEL};

fn require<T: PartialEq + std::fmt::Debug>(
    what: &str,
    input: T,
    output: T,
) -> Result<()> {
    if input == output {
        Ok(())
    } else {
        Err(Error::mismatch(format!(
            "{}: input {:?}, output {:?}",
            what, input, output
        )))
    }
}

/// Proves that `output` holds the first `frames` frames of `input`
/// bit for bit, with `expected` describing the time axis of the output.
pub fn verify(
    input: &dyn ReportReader,
    output: &dyn ReportReader,
    expected: &ReportMetadata,
    frames: u64,
) -> Result<()> {
    require("start", input.start(), output.start())?;
    require("end", expected.end, output.end())?;
    require("timestep", input.step(), output.step())?;
    require("frame size", input.frame_size(), output.frame_size())?;
    if input.data_unit().is_empty() || input.time_unit().is_empty() {
        return Err(Error::mismatch("input units are empty"));
    }
    require("data unit", input.data_unit(), output.data_unit())?;
    require("time unit", input.time_unit(), output.time_unit())?;
    require("gids", input.gids(), output.gids())?;

    for (name, report) in [("input", input), ("output", output)] {
        if report.offsets().len() != report.counts().len() {
            return Err(Error::mismatch(format!(
                "{} has {} offset and {} count tables",
                name,
                report.offsets().len(),
                report.counts().len()
            )));
        }
    }
    require("offset tables", input.offsets().len(), output.offsets().len())?;
    for (i, &gid) in input.gids().iter().enumerate() {
        require(
            &format!("offsets of gid {}", gid),
            &input.offsets()[i],
            &output.offsets()[i],
        )?;
        require(
            &format!("counts of gid {}", gid),
            &input.counts()[i],
            &output.counts()[i],
        )?;
        let frame_size = output.frame_size();
        if let Some(offset) = output.offsets()[i]
            .iter()
            .find(|&&o| o != OFFSET_SENTINEL && o >= frame_size)
        {
            return Err(Error::mismatch(format!(
                "gid {} offset {} is outside frame size {}",
                gid, offset, frame_size
            )));
        }
    }

    for index in 0..frames {
        let timestamp = expected.frame_time(index);
        let missing = |name: &str| {
            Error::mismatch(format!("{} has no frame at t={}", name, timestamp))
        };
        let want = input
            .load_frame(timestamp)?
            .ok_or_else(|| missing("input"))?;
        let got = output
            .load_frame(timestamp)?
            .ok_or_else(|| missing("output"))?;
        if got.len() != want.len() {
            return Err(Error::mismatch(format!(
                "frame at t={} holds {} values, expected {}",
                timestamp,
                got.len(),
                want.len()
            )));
        }
        if let Some(position) = want
            .iter()
            .zip(&got)
            .position(|(a, b)| a.to_bits() != b.to_bits())
        {
            return Err(Error::mismatch(format!(
                "frame at t={} differs at compartment {}: {} != {}",
                timestamp, position, want[position], got[position]
            )));
        }
    }
    debug!(frames, "output verified");
    Ok(())
}
