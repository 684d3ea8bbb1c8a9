use super::error::{Error, Result};

/// Offset of a section that carries no compartments.
pub const OFFSET_SENTINEL: u64 = u64::MAX;

/// Slack applied when turning a time span into a whole number of frames.
const FRAME_TOLERANCE: f64 = 1e-6;

/// Time axis and units of a report. Immutable once a header is written.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportMetadata {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub data_unit: String,
    pub time_unit: String,
}

impl ReportMetadata {
    /// Checks the invariants a writer requires before accepting a header.
    pub fn validate(&self) -> Result<()> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(Error::InvalidHeader(format!(
                "time range {}..{} is not finite",
                self.start, self.end
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(Error::InvalidHeader(format!(
                "timestep {} must be positive",
                self.step
            )));
        }
        if self.end < self.start {
            return Err(Error::InvalidHeader(format!(
                "end {} precedes start {}",
                self.end, self.start
            )));
        }
        if self.data_unit.is_empty() || self.time_unit.is_empty() {
            return Err(Error::InvalidHeader("units must be non-empty".into()));
        }
        Ok(())
    }

    /// Number of whole frames in `[start, end)`.
    pub fn frame_count(&self) -> u64 {
        if !(self.step > 0.0) || self.end <= self.start {
            return 0;
        }
        ((self.end - self.start) / self.step + FRAME_TOLERANCE).floor() as u64
    }

    /// Timestamp of the frame at `index`, recomputed from the start so that
    /// iterating frames never accumulates rounding error.
    pub fn frame_time(&self, index: u64) -> f64 {
        self.start + index as f64 * self.step
    }

    /// Snaps `timestamp` to the nearest frame, or `None` if it falls
    /// outside `[start, end)`.
    pub fn frame_index(&self, timestamp: f64) -> Option<u64> {
        if !timestamp.is_finite() || !(self.step > 0.0) {
            return None;
        }
        let position = (timestamp - self.start) / self.step;
        if position < -FRAME_TOLERANCE {
            return None;
        }
        let index = position.round().max(0.0) as u64;
        (index < self.frame_count()).then_some(index)
    }

    /// Copy of this metadata with `end` limited to `max_frames` frames.
    pub fn clamped(&self, max_frames: Option<u64>) -> Self {
        let mut clamped = self.clone();
        if let Some(max_frames) = max_frames {
            let max_end = self.start + max_frames as f64 * self.step;
            clamped.end = self.end.min(max_end);
        }
        clamped
    }
}

/// Per-neuron section layout of a frame, indexed in ascending GID order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Layout {
    pub gids: Vec<u32>,
    pub counts: Vec<Vec<u16>>,
    pub offsets: Vec<Vec<u64>>,
    pub frame_size: u64,
}

impl Layout {
    /// Builds a layout whose sections are packed back to back in GID order.
    pub fn contiguous(gids: Vec<u32>, counts: Vec<Vec<u16>>) -> Self {
        let mut cursor = 0u64;
        let offsets = counts
            .iter()
            .map(|sections| {
                sections
                    .iter()
                    .map(|&count| {
                        if count == 0 {
                            OFFSET_SENTINEL
                        } else {
                            let offset = cursor;
                            cursor += u64::from(count);
                            offset
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            gids,
            counts,
            offsets,
            frame_size: cursor,
        }
    }

    pub fn len(&self) -> usize {
        self.gids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gids.is_empty()
    }

    /// Total compartments of the neuron at `index`.
    pub fn num_compartments(&self, index: usize) -> usize {
        self.counts[index].iter().map(|&c| usize::from(c)).sum()
    }

    /// Largest per-neuron compartment total, used to size slice buffers.
    pub fn max_compartments(&self) -> usize {
        (0..self.len())
            .map(|i| self.num_compartments(i))
            .max()
            .unwrap_or(0)
    }

    /// Structural checks every reader runs before exposing a layout.
    pub fn validate(&self) -> Result<()> {
        if self.counts.len() != self.gids.len()
            || self.offsets.len() != self.gids.len()
        {
            return Err(Error::InvalidHeader(format!(
                "{} gids with {} count and {} offset tables",
                self.gids.len(),
                self.counts.len(),
                self.offsets.len()
            )));
        }
        if let Some(pair) = self.gids.windows(2).find(|w| w[0] >= w[1]) {
            return Err(Error::layout(
                pair[1],
                "gids are not strictly ascending",
            ));
        }
        let mut total = 0u64;
        for (i, &gid) in self.gids.iter().enumerate() {
            let (counts, offsets) = (&self.counts[i], &self.offsets[i]);
            if counts.len() != offsets.len() {
                return Err(Error::layout(
                    gid,
                    format!(
                        "{} sections with {} offsets",
                        counts.len(),
                        offsets.len()
                    ),
                ));
            }
            for (&count, &offset) in counts.iter().zip(offsets) {
                if offset == OFFSET_SENTINEL {
                    if count != 0 {
                        return Err(Error::layout(
                            gid,
                            "empty-section offset with compartments",
                        ));
                    }
                    continue;
                }
                if offset.saturating_add(u64::from(count)) > self.frame_size {
                    return Err(Error::layout(
                        gid,
                        format!(
                            "section {}..{} exceeds frame size {}",
                            offset,
                            offset.saturating_add(u64::from(count)),
                            self.frame_size
                        ),
                    ));
                }
                total += u64::from(count);
            }
        }
        if total != self.frame_size {
            return Err(Error::InvalidHeader(format!(
                "sections hold {} compartments, frame size is {}",
                total, self.frame_size
            )));
        }
        Ok(())
    }
}
