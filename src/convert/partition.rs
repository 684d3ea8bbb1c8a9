use std::ops::Range;

use tracing::debug;

use crate::report::{self, Layout, ReportWriter};

/// Indices of the neurons whose compartment counts `rank` commits. The
/// ranges of all ranks tile `0..count` with boundaries rounded down.
pub fn owned_range(count: usize, rank: usize, world: usize) -> Range<usize> {
    let split = |r: usize| (r as u128 * count as u128 / world as u128) as usize;
    split(rank)..split(rank + 1)
}

/// Declares every neuron of `layout` on `writer`, committing compartment
/// counts only for the `owned` indices.
pub fn declare_layout(
    writer: &mut dyn ReportWriter,
    layout: &Layout,
    owned: Range<usize>,
) -> report::Result<()> {
    for (i, &gid) in layout.gids.iter().enumerate() {
        if owned.contains(&i) {
            writer.write_compartments(gid, &layout.counts[i])?;
        } else {
            writer.declare_gid(gid)?;
        }
    }
    debug!(owned = ?owned, neurons = layout.len(), "layout declared");
    Ok(())
}
