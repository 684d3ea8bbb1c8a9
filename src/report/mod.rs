//! Compartment report access.
//!
//! A report is opened from a URI whose format is deduced from its path:
//! the read-only legacy binary format ([`legacy`]) or the sharded
//! container ([`container`]) that supports many concurrent writers.

use std::path::{Path, PathBuf};

use tracing::debug;
use typed_builder::TypedBuilder;

pub mod container;
mod error;
pub mod legacy;
mod metadata;

pub use error::{Error, Result};
pub use metadata::{Layout, ReportMetadata, OFFSET_SENTINEL};

/// Random access to an existing report.
///
/// Implementations must allow concurrent `load_frame` calls for distinct
/// timestamps from multiple threads.
pub trait ReportReader: Send + Sync {
    fn metadata(&self) -> &ReportMetadata;

    fn layout(&self) -> &Layout;

    /// Loads the frame nearest to `timestamp`, or `None` if the timestamp
    /// is outside `[start, end)` or the store has no record for it.
    fn load_frame(&self, timestamp: f64) -> Result<Option<Vec<f32>>>;

    fn start(&self) -> f64 {
        self.metadata().start
    }

    fn end(&self) -> f64 {
        self.metadata().end
    }

    fn step(&self) -> f64 {
        self.metadata().step
    }

    fn data_unit(&self) -> &str {
        &self.metadata().data_unit
    }

    fn time_unit(&self) -> &str {
        &self.metadata().time_unit
    }

    fn gids(&self) -> &[u32] {
        &self.layout().gids
    }

    fn frame_size(&self) -> u64 {
        self.layout().frame_size
    }

    fn offsets(&self) -> &[Vec<u64>] {
        &self.layout().offsets
    }

    fn counts(&self) -> &[Vec<u16>] {
        &self.layout().counts
    }

    fn num_compartments(&self, index: usize) -> usize {
        self.layout().num_compartments(index)
    }
}

/// Sequential construction of a report.
///
/// The calls must come in this order: one `write_header`, then for every
/// neuron in ascending GID order either `declare_gid` or
/// `write_compartments`, then any number of `write_frame` in any
/// (gid, timestamp) order, then one `flush`.
pub trait ReportWriter: Send {
    fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()>;

    /// Reserves a slot for a neuron whose data another writer supplies.
    fn declare_gid(&mut self, gid: u32) -> Result<()>;

    /// Reserves a slot and makes this writer the data owner of `gid`.
    fn write_compartments(&mut self, gid: u32, counts: &[u16]) -> Result<()>;

    fn write_frame(
        &mut self,
        gid: u32,
        voltages: &[f32],
        timestamp: f64,
    ) -> Result<()>;

    /// Makes everything written so far durable and readable.
    fn flush(&mut self) -> Result<()>;
}

/// How a writer shares its output with the other ranks of a conversion.
#[derive(Debug, Clone, TypedBuilder)]
pub struct WriterOptions {
    /// Replace an existing report instead of failing.
    #[builder(default = false)]
    pub overwrite: bool,
    /// Index of this writer among all writers of the report.
    #[builder(default = 0)]
    pub rank: usize,
    /// Number of writers producing the report together.
    #[builder(default = 1)]
    pub world: usize,
}

/// On-disk representations understood by [`open_reader`] and
/// [`open_writer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Legacy,
    Container,
}

impl Format {
    /// Deduces the format from the extension, falling back to sniffing an
    /// existing path.
    pub fn detect(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("bin" | "bbp") => return Some(Self::Legacy),
            Some("h5" | "crep") => return Some(Self::Container),
            _ => {}
        }
        if container::is_container(path) {
            Some(Self::Container)
        } else if legacy::is_legacy(path) {
            Some(Self::Legacy)
        } else {
            None
        }
    }
}

/// Resolves a report URI to a filesystem path. Only local paths and the
/// `file://` scheme are supported.
pub fn uri_to_path(uri: &str) -> Result<PathBuf> {
    match uri.split_once("://") {
        None => Ok(PathBuf::from(uri)),
        Some(("file", path)) => Ok(PathBuf::from(path)),
        Some((scheme, _)) => Err(Error::open(
            uri,
            format!("unsupported scheme '{}'", scheme),
        )),
    }
}

pub fn open_reader(uri: &str) -> Result<Box<dyn ReportReader>> {
    let path = uri_to_path(uri)?;
    let format = Format::detect(&path)
        .ok_or_else(|| Error::open(uri, "unrecognized report format"))?;
    debug!(uri, ?format, "opening report for reading");
    Ok(match format {
        Format::Legacy => Box::new(legacy::LegacyReader::open(&path)?),
        Format::Container => {
            Box::new(container::ContainerReader::open(&path)?)
        }
    })
}

pub fn open_writer(
    uri: &str,
    options: &WriterOptions,
) -> Result<Box<dyn ReportWriter>> {
    let path = uri_to_path(uri)?;
    let format = Format::detect(&path)
        .ok_or_else(|| Error::open(uri, "unrecognized report format"))?;
    debug!(uri, ?format, ?options, "opening report for writing");
    match format {
        Format::Legacy => {
            Err(Error::open(uri, "legacy binary reports are read-only"))
        }
        Format::Container => Ok(Box::new(container::ContainerWriter::create(
            &path, options,
        )?)),
    }
}
