//! Read-only legacy binary compartment reports.
//!
//! The file is a little-endian header followed by the dense frames:
//!
//! ```text
//! magic "CMPRTBIN" | byte order mark u32 | version u32
//! start f64 | end f64 | step f64
//! data unit (u32 len + utf8) | time unit (u32 len + utf8)
//! neurons u32 | frame size u64 | stored frames u64
//! per neuron: gid u32 | sections u32 | sections x (offset u64 | count u16)
//! stored frames x frame size x f32
//! ```
//!
//! Sections may sit anywhere in a stored frame. The reader exposes them
//! packed back to back in GID order and rearranges every loaded frame to
//! match, so a converted report carries the same offsets as its input.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::Path,
    sync::Mutex,
};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use tracing::{debug, trace};

use super::{
    Error, Layout, ReportMetadata, ReportReader, Result, OFFSET_SENTINEL,
};

pub(crate) const MAGIC: &[u8; 8] = b"CMPRTBIN";
pub(crate) const BYTE_ORDER_MARK: u32 = 0x0102_0304;
pub(crate) const VERSION: u32 = 1;

const MAX_UNIT_LEN: u32 = 256;
const SECTION_RECORD_LEN: u64 = 8 + 2;

/// Returns true if `path` is a file starting with the legacy magic.
pub fn is_legacy(path: &Path) -> bool {
    let mut magic = [0u8; 8];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map(|()| &magic == MAGIC)
        .unwrap_or(false)
}

pub struct LegacyReader {
    metadata: ReportMetadata,
    layout: Layout,
    stored_frames: u64,
    data_offset: u64,
    /// Stored position of every exposed compartment, unless the file is
    /// already in exposed order.
    gather: Option<Vec<usize>>,
    file: Mutex<File>,
}

/// Stored frame position of each compartment of the contiguous layout.
fn gather_positions(stored: &Layout) -> Option<Vec<usize>> {
    let mut positions = Vec::with_capacity(stored.frame_size as usize);
    for (offsets, counts) in stored.offsets.iter().zip(&stored.counts) {
        for (&offset, &count) in offsets.iter().zip(counts) {
            if offset == OFFSET_SENTINEL {
                continue;
            }
            let offset = offset as usize;
            positions.extend(offset..offset + usize::from(count));
        }
    }
    let identity = positions.iter().enumerate().all(|(i, &p)| i == p);
    (!identity).then_some(positions)
}

impl LegacyReader {
    pub fn open(path: &Path) -> Result<Self> {
        let uri = path.display().to_string();
        let file = File::open(path).map_err(|e| Error::open(&uri, e))?;
        let file_len = file.metadata()?.len();

        let mut reader = BufReader::new(&file);
        let header = read_header(&mut reader, file_len)
            .map_err(|e| Error::open(&uri, e))?;
        let data_offset = reader.stream_position()?;
        drop(reader);

        let data_len = header
            .stored_frames
            .checked_mul(header.layout.frame_size)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| Error::open(&uri, "data region overflows"))?;
        if data_offset + data_len != file_len {
            return Err(Error::open(
                &uri,
                format!(
                    "expected {} bytes of frame data, found {}",
                    data_len,
                    file_len.saturating_sub(data_offset)
                ),
            ));
        }
        header
            .metadata
            .validate()
            .map_err(|e| Error::open(&uri, e))?;
        header.layout.validate().map_err(|e| Error::open(&uri, e))?;
        let gather = gather_positions(&header.layout);
        let layout =
            Layout::contiguous(header.layout.gids, header.layout.counts);

        debug!(
            uri = %uri,
            neurons = layout.len(),
            frame_size = layout.frame_size,
            stored_frames = header.stored_frames,
            reordered = gather.is_some(),
            "opened legacy report"
        );
        Ok(Self {
            metadata: header.metadata,
            layout,
            stored_frames: header.stored_frames,
            data_offset,
            gather,
            file: Mutex::new(file),
        })
    }
}

impl ReportReader for LegacyReader {
    fn metadata(&self) -> &ReportMetadata {
        &self.metadata
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn load_frame(&self, timestamp: f64) -> Result<Option<Vec<f32>>> {
        let Some(index) = self.metadata.frame_index(timestamp) else {
            return Ok(None);
        };
        if index >= self.stored_frames {
            return Ok(None);
        }
        let frame_size = self.layout.frame_size as usize;
        let mut bytes = vec![0u8; frame_size * 4];
        {
            let mut file = self.file.lock().map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "report file poisoned")
            })?;
            file.seek(SeekFrom::Start(
                self.data_offset + index * self.layout.frame_size * 4,
            ))?;
            file.read_exact(&mut bytes)?;
        }
        let mut frame = vec![0f32; frame_size];
        LittleEndian::read_f32_into(&bytes, &mut frame);
        if let Some(gather) = &self.gather {
            frame = gather.iter().map(|&position| frame[position]).collect();
        }
        trace!(index, timestamp, "loaded legacy frame");
        Ok(Some(frame))
    }
}

struct Header {
    metadata: ReportMetadata,
    layout: Layout,
    stored_frames: u64,
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

fn read_unit(reader: &mut impl Read) -> io::Result<String> {
    let len = reader.read_u32::<LittleEndian>()?;
    if len > MAX_UNIT_LEN {
        return Err(invalid(format!("unit string of {} bytes", len)));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| invalid("unit is not utf-8"))
}

fn read_header(reader: &mut impl Read, file_len: u64) -> io::Result<Header> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid("not a legacy compartment report"));
    }
    match reader.read_u32::<LittleEndian>()? {
        BYTE_ORDER_MARK => {}
        mark if mark == BYTE_ORDER_MARK.swap_bytes() => {
            return Err(invalid("big-endian reports are not supported"))
        }
        _ => return Err(invalid("corrupt byte order mark")),
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(invalid(format!("unsupported version {}", version)));
    }

    let start = reader.read_f64::<LittleEndian>()?;
    let end = reader.read_f64::<LittleEndian>()?;
    let step = reader.read_f64::<LittleEndian>()?;
    let data_unit = read_unit(reader)?;
    let time_unit = read_unit(reader)?;

    let neurons = reader.read_u32::<LittleEndian>()?;
    let frame_size = reader.read_u64::<LittleEndian>()?;
    let stored_frames = reader.read_u64::<LittleEndian>()?;

    let mut cells = Vec::with_capacity((neurons as usize).min(1 << 16));
    for _ in 0..neurons {
        let gid = reader.read_u32::<LittleEndian>()?;
        let sections = reader.read_u32::<LittleEndian>()?;
        if u64::from(sections) * SECTION_RECORD_LEN > file_len {
            return Err(invalid(format!(
                "gid {} claims {} sections",
                gid, sections
            )));
        }
        let mut offsets = Vec::with_capacity(sections as usize);
        let mut counts = Vec::with_capacity(sections as usize);
        for _ in 0..sections {
            offsets.push(reader.read_u64::<LittleEndian>()?);
            counts.push(reader.read_u16::<LittleEndian>()?);
        }
        cells.push((gid, counts, offsets));
    }

    cells.sort_by_key(|(gid, ..)| *gid);
    if let Some(pair) = cells.windows(2).find(|w| w[0].0 == w[1].0) {
        return Err(invalid(format!("gid {} appears twice", pair[0].0)));
    }
    let mut layout = Layout {
        frame_size,
        ..Layout::default()
    };
    for (gid, counts, offsets) in cells {
        layout.gids.push(gid);
        layout.counts.push(counts);
        layout.offsets.push(offsets);
    }

    Ok(Header {
        metadata: ReportMetadata {
            start,
            end,
            step,
            data_unit,
            time_unit,
        },
        layout,
        stored_frames,
    })
}
