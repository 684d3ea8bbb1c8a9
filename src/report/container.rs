//! Sharded container reports.
//!
//! A container is a directory. Every writer of a conversion owns one shard
//! and never touches another writer's files, so ranks can write the same
//! report concurrently without locking:
//!
//! ```text
//! out.h5/
//!   header.bin        time axis, units and writer count
//!   shard-0000.map    gids declared by writer 0, the neurons whose counts
//!                     it committed and the index of its frame blocks
//!   shard-0000.dat    frame blocks written by writer 0
//!   ...
//! ```
//!
//! A frame block holds the slices of some neurons at one frame:
//! `frame u64 | n u32 | n x (neuron index u32, len u32) | f32 data`, all
//! little-endian. A writer emits a block as soon as it has a slice for every
//! neuron of a frame, and once more at flush for frames it only partly
//! wrote. Blocks are applied in shard order then file order, so the last
//! write of a (gid, frame) pair wins.
//!
//! `header.bin` and the `.map` files are `magic | blake3 | rkyv payload`.
//! Offsets of a container are always contiguous in GID order.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    Error, Layout, ReportMetadata, ReportReader, ReportWriter, Result,
    WriterOptions,
};

const HEADER_FILE: &str = "header.bin";
const HEADER_MAGIC: &[u8; 8] = b"CREPHDR1";
const SHARD_MAGIC: &[u8; 8] = b"CREPMAP1";
const DIGEST_LEN: usize = 32;

/// Returns true if `path` is a directory holding a container header.
pub fn is_container(path: &Path) -> bool {
    path.join(HEADER_FILE).is_file()
}

fn map_path(root: &Path, rank: usize) -> PathBuf {
    root.join(format!("shard-{:04}.map", rank))
}

fn data_path(root: &Path, rank: usize) -> PathBuf {
    root.join(format!("shard-{:04}.dat", rank))
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
struct StoredHeader {
    start: f64,
    end: f64,
    step: f64,
    data_unit: String,
    time_unit: String,
    writers: u32,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
struct OwnedNeuron {
    gid: u32,
    counts: Vec<u16>,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[archive(check_bytes)]
struct StoredBlock {
    frame: u64,
    position: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
struct ShardMap {
    rank: u32,
    /// Every gid of the report in ascending order.
    gids: Vec<u32>,
    /// Neurons whose compartment counts this writer committed.
    owned: Vec<OwnedNeuron>,
    blocks: Vec<StoredBlock>,
    data_len: u64,
}

fn serialization_failed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "cannot serialize container metadata")
}

fn corrupt_block(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Frames `magic | blake3(payload) | payload`.
fn seal(magic: &[u8; 8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + DIGEST_LEN + payload.len());
    buf.extend_from_slice(magic);
    buf.extend_from_slice(blake3::hash(payload).as_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Checks magic and digest and returns the payload, aligned for rkyv.
fn unseal(
    magic: &[u8; 8],
    bytes: &[u8],
) -> std::result::Result<AlignedVec, String> {
    if bytes.len() < 8 + DIGEST_LEN || &bytes[..8] != magic {
        return Err("bad magic".into());
    }
    let (digest, payload) = bytes[8..].split_at(DIGEST_LEN);
    if blake3::hash(payload).as_bytes() != digest {
        return Err("checksum mismatch".into());
    }
    let mut aligned = AlignedVec::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    Ok(aligned)
}

/// Writes `bytes` next to `path` and renames it into place, so readers and
/// concurrent writers of identical content only ever see whole files.
fn replace_file(path: &Path, rank: usize, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", rank));
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Slices of one frame collected until every neuron has one.
struct Row {
    slices: Vec<Option<Vec<f32>>>,
    filled: usize,
}

impl Row {
    fn new(neurons: usize) -> Self {
        Self {
            slices: vec![None; neurons],
            filled: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Layout,
    Frames,
    Flushed,
}

pub struct ContainerWriter {
    root: PathBuf,
    rank: usize,
    world: usize,
    stage: Stage,
    metadata: Option<ReportMetadata>,
    gids: Vec<u32>,
    index: HashMap<u32, usize>,
    /// Slice length per neuron: committed counts for owned neurons, the
    /// first written length for the others.
    lens: Vec<Option<usize>>,
    owned: Vec<OwnedNeuron>,
    data: Option<BufWriter<File>>,
    position: u64,
    blocks: Vec<StoredBlock>,
    pending: HashMap<u64, Row>,
    block: Vec<u8>,
}

impl ContainerWriter {
    pub fn create(path: &Path, options: &WriterOptions) -> Result<Self> {
        let uri = path.display().to_string();
        if options.world == 0 || options.rank >= options.world {
            return Err(Error::open(
                &uri,
                format!(
                    "writer {} is outside a world of {}",
                    options.rank, options.world
                ),
            ));
        }
        if options.overwrite {
            if path.exists() && !path.is_dir() {
                return Err(Error::open(&uri, "not a container directory"));
            }
            fs::create_dir_all(path).map_err(|e| Error::open(&uri, e))?;
        } else {
            if options.world > 1 {
                return Err(Error::ConcurrentWriteUnsupported {
                    uri,
                    writers: options.world,
                });
            }
            match fs::create_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(Error::Exists { uri })
                }
                Err(e) => return Err(Error::open(&uri, e)),
            }
        }
        // an interrupted earlier run must not leave a readable shard behind
        let rank = options.rank;
        for stale in [map_path(path, rank), data_path(path, rank)] {
            match fs::remove_file(&stale) {
                Ok(()) => {
                    debug!(path = %stale.display(), "removed stale shard")
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self {
            root: path.to_path_buf(),
            rank: options.rank,
            world: options.world,
            stage: Stage::Header,
            metadata: None,
            gids: Vec::new(),
            index: HashMap::new(),
            lens: Vec::new(),
            owned: Vec::new(),
            data: None,
            position: 0,
            blocks: Vec::new(),
            pending: HashMap::new(),
            block: Vec::new(),
        })
    }

    fn expect_layout_stage(&self, operation: &'static str) -> Result<()> {
        match self.stage {
            Stage::Layout => Ok(()),
            Stage::Header => Err(Error::OutOfOrder {
                operation,
                reason: "header not written",
            }),
            Stage::Frames | Stage::Flushed => Err(Error::OutOfOrder {
                operation,
                reason: "layout is frozen once frames are written",
            }),
        }
    }

    fn push_gid(&mut self, gid: u32, len: Option<usize>) -> Result<()> {
        if let Some(&last) = self.gids.last() {
            if gid <= last {
                return Err(Error::layout(
                    gid,
                    format!("declared after gid {}", last),
                ));
            }
        }
        self.index.insert(gid, self.gids.len());
        self.gids.push(gid);
        self.lens.push(len);
        Ok(())
    }

    /// Ends the layout phase and creates the data file.
    fn freeze(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(data_path(&self.root, self.rank))?;
        self.data = Some(BufWriter::new(file));
        self.stage = Stage::Frames;
        debug!(
            rank = self.rank,
            neurons = self.gids.len(),
            owned = self.owned.len(),
            "container layout frozen"
        );
        Ok(())
    }

    /// Appends the slices collected for `frame` as one block.
    fn emit(&mut self, frame: u64, row: Row) -> Result<()> {
        let entries: Vec<(usize, Vec<f32>)> = row
            .slices
            .into_iter()
            .enumerate()
            .filter_map(|(i, slice)| slice.map(|slice| (i, slice)))
            .collect();
        self.block.clear();
        self.block.write_u64::<LittleEndian>(frame)?;
        self.block.write_u32::<LittleEndian>(entries.len() as u32)?;
        for (i, slice) in &entries {
            self.block.write_u32::<LittleEndian>(*i as u32)?;
            self.block.write_u32::<LittleEndian>(slice.len() as u32)?;
        }
        for (_, slice) in &entries {
            for &value in slice {
                self.block.write_f32::<LittleEndian>(value)?;
            }
        }
        if let Some(data) = self.data.as_mut() {
            data.write_all(&self.block)?;
        }
        self.blocks.push(StoredBlock {
            frame,
            position: self.position,
        });
        self.position += self.block.len() as u64;
        trace!(frame, neurons = entries.len(), "container block written");
        Ok(())
    }
}

impl ReportWriter for ContainerWriter {
    fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()> {
        if self.stage != Stage::Header {
            return Err(Error::OutOfOrder {
                operation: "write_header",
                reason: "header already written",
            });
        }
        metadata.validate()?;
        let header = StoredHeader {
            start: metadata.start,
            end: metadata.end,
            step: metadata.step,
            data_unit: metadata.data_unit.clone(),
            time_unit: metadata.time_unit.clone(),
            writers: self.world as u32,
        };
        let payload = rkyv::to_bytes::<_, 256>(&header)
            .map_err(|_| serialization_failed())?;
        replace_file(
            &self.root.join(HEADER_FILE),
            self.rank,
            &seal(HEADER_MAGIC, &payload),
        )?;
        self.metadata = Some(metadata.clone());
        self.stage = Stage::Layout;
        Ok(())
    }

    fn declare_gid(&mut self, gid: u32) -> Result<()> {
        self.expect_layout_stage("declare_gid")?;
        self.push_gid(gid, None)
    }

    fn write_compartments(&mut self, gid: u32, counts: &[u16]) -> Result<()> {
        self.expect_layout_stage("write_compartments")?;
        let len = counts.iter().map(|&c| usize::from(c)).sum();
        self.push_gid(gid, Some(len))?;
        self.owned.push(OwnedNeuron {
            gid,
            counts: counts.to_vec(),
        });
        Ok(())
    }

    fn write_frame(
        &mut self,
        gid: u32,
        voltages: &[f32],
        timestamp: f64,
    ) -> Result<()> {
        match self.stage {
            Stage::Header => {
                return Err(Error::OutOfOrder {
                    operation: "write_frame",
                    reason: "header not written",
                })
            }
            Stage::Layout => self.freeze()?,
            Stage::Frames => {}
            Stage::Flushed => {
                return Err(Error::OutOfOrder {
                    operation: "write_frame",
                    reason: "report already flushed",
                })
            }
        }
        let i = *self
            .index
            .get(&gid)
            .ok_or_else(|| Error::layout(gid, "not declared by this writer"))?;
        match self.lens[i] {
            Some(expected) if expected != voltages.len() => {
                return Err(Error::Size {
                    gid,
                    expected,
                    found: voltages.len(),
                })
            }
            Some(_) => {}
            None => self.lens[i] = Some(voltages.len()),
        }
        let frame = self
            .metadata
            .as_ref()
            .and_then(|md| md.frame_index(timestamp))
            .ok_or(Error::NoSuchFrame { timestamp })?;

        let neurons = self.gids.len();
        let row = self
            .pending
            .entry(frame)
            .or_insert_with(|| Row::new(neurons));
        if row.slices[i].replace(voltages.to_vec()).is_none() {
            row.filled += 1;
        }
        if row.filled == neurons {
            if let Some(row) = self.pending.remove(&frame) {
                self.emit(frame, row)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match self.stage {
            Stage::Header => {
                return Err(Error::OutOfOrder {
                    operation: "flush",
                    reason: "header not written",
                })
            }
            Stage::Layout => self.freeze()?,
            Stage::Frames => {}
            Stage::Flushed => {
                return Err(Error::OutOfOrder {
                    operation: "flush",
                    reason: "report already flushed",
                })
            }
        }
        let mut partial: Vec<(u64, Row)> = self.pending.drain().collect();
        partial.sort_unstable_by_key(|(frame, _)| *frame);
        if !partial.is_empty() {
            debug!(frames = partial.len(), "writing partially filled frames");
        }
        for (frame, row) in partial {
            self.emit(frame, row)?;
        }
        if let Some(data) = self.data.as_mut() {
            data.flush()?;
            data.get_ref().sync_all()?;
        }
        let map = ShardMap {
            rank: self.rank as u32,
            gids: self.gids.clone(),
            owned: self.owned.clone(),
            blocks: self.blocks.clone(),
            data_len: self.position,
        };
        let payload = rkyv::to_bytes::<_, 1024>(&map)
            .map_err(|_| serialization_failed())?;
        replace_file(
            &map_path(&self.root, self.rank),
            self.rank,
            &seal(SHARD_MAGIC, &payload),
        )?;
        self.stage = Stage::Flushed;
        debug!(
            rank = self.rank,
            blocks = self.blocks.len(),
            "container shard flushed"
        );
        Ok(())
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if self.stage != Stage::Flushed && self.stage != Stage::Header {
            warn!(
                rank = self.rank,
                "container writer dropped before flush, shard is unreadable"
            );
        }
    }
}

pub struct ContainerReader {
    metadata: ReportMetadata,
    layout: Layout,
    /// Position of each neuron's first compartment in a frame.
    starts: Vec<usize>,
    shards: Vec<Mutex<File>>,
    /// Per frame, the (shard, position) of every block holding it.
    frames: HashMap<u64, Vec<(usize, u64)>>,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self> {
        let uri = path.display().to_string();
        let corrupt = |reason: String| Error::open(&uri, reason);

        let bytes = fs::read(path.join(HEADER_FILE))
            .map_err(|e| Error::open(&uri, e))?;
        let payload = unseal(HEADER_MAGIC, &bytes)
            .map_err(|e| corrupt(format!("header: {}", e)))?;
        let header: StoredHeader = rkyv::from_bytes(&payload)
            .map_err(|_| corrupt("header does not validate".into()))?;
        let metadata = ReportMetadata {
            start: header.start,
            end: header.end,
            step: header.step,
            data_unit: header.data_unit,
            time_unit: header.time_unit,
        };
        metadata.validate().map_err(|e| corrupt(e.to_string()))?;
        if header.writers == 0 {
            return Err(corrupt("header names no writers".into()));
        }
        let frame_count = metadata.frame_count();

        let mut gids: Option<Vec<u32>> = None;
        let mut counts_by_gid: HashMap<u32, Vec<u16>> = HashMap::new();
        let mut frames: HashMap<u64, Vec<(usize, u64)>> = HashMap::new();
        let mut shards = Vec::with_capacity(header.writers as usize);
        for rank in 0..header.writers as usize {
            let bytes = fs::read(map_path(path, rank)).map_err(|e| {
                corrupt(format!("shard {} was not flushed: {}", rank, e))
            })?;
            let payload = unseal(SHARD_MAGIC, &bytes)
                .map_err(|e| corrupt(format!("shard {}: {}", rank, e)))?;
            let map: ShardMap = rkyv::from_bytes(&payload).map_err(|_| {
                corrupt(format!("shard {} does not validate", rank))
            })?;
            if map.rank as usize != rank {
                return Err(corrupt(format!(
                    "shard {} claims rank {}",
                    rank, map.rank
                )));
            }
            match &gids {
                None => gids = Some(map.gids.clone()),
                Some(expected) if *expected != map.gids => {
                    return Err(corrupt(format!(
                        "shard {} declares a different gid set",
                        rank
                    )))
                }
                Some(_) => {}
            }
            for neuron in map.owned {
                if map.gids.binary_search(&neuron.gid).is_err() {
                    return Err(corrupt(format!(
                        "shard {} owns undeclared gid {}",
                        rank, neuron.gid
                    )));
                }
                if counts_by_gid.insert(neuron.gid, neuron.counts).is_some() {
                    return Err(corrupt(format!(
                        "gid {} is owned by two shards",
                        neuron.gid
                    )));
                }
            }

            let file = File::open(data_path(path, rank))
                .map_err(|e| corrupt(format!("shard {} data: {}", rank, e)))?;
            let len = file.metadata()?.len();
            if len != map.data_len {
                return Err(corrupt(format!(
                    "shard {} holds {} bytes, expected {}",
                    rank, len, map.data_len
                )));
            }
            for block in map.blocks {
                if block.frame >= frame_count || block.position >= len {
                    return Err(corrupt(format!(
                        "shard {} indexes frame {} at byte {}",
                        rank, block.frame, block.position
                    )));
                }
                frames
                    .entry(block.frame)
                    .or_default()
                    .push((rank, block.position));
            }
            shards.push(Mutex::new(file));
        }

        let gids = gids.unwrap_or_default();
        let mut counts = Vec::with_capacity(gids.len());
        for &gid in &gids {
            let sections = counts_by_gid.remove(&gid).ok_or_else(|| {
                corrupt(format!("gid {} was declared but never written", gid))
            })?;
            counts.push(sections);
        }
        let layout = Layout::contiguous(gids, counts);
        layout.validate().map_err(|e| corrupt(e.to_string()))?;
        let mut starts = Vec::with_capacity(layout.len());
        let mut cursor = 0;
        for i in 0..layout.len() {
            starts.push(cursor);
            cursor += layout.num_compartments(i);
        }

        debug!(
            uri = %uri,
            neurons = layout.len(),
            shards = shards.len(),
            frame_size = layout.frame_size,
            "opened container report"
        );
        Ok(Self {
            metadata,
            layout,
            starts,
            shards,
            frames,
        })
    }

    /// Copies the slices of the block at `position` into `frame`.
    fn apply_block(
        &self,
        shard: usize,
        position: u64,
        index: u64,
        frame: &mut [f32],
        covered: &mut [bool],
    ) -> Result<()> {
        let file = self.shards[shard].lock().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "shard lock poisoned")
        })?;
        let mut reader = BufReader::new(&*file);
        reader.seek(SeekFrom::Start(position))?;
        let stored = reader.read_u64::<LittleEndian>()?;
        if stored != index {
            return Err(corrupt_block(format!(
                "block at byte {} of shard {} holds frame {}, expected {}",
                position, shard, stored, index
            ))
            .into());
        }
        let entries = reader.read_u32::<LittleEndian>()? as usize;
        let mut table = Vec::with_capacity(entries);
        for _ in 0..entries {
            let neuron = reader.read_u32::<LittleEndian>()? as usize;
            let len = reader.read_u32::<LittleEndian>()? as usize;
            table.push((neuron, len));
        }
        for (neuron, len) in table {
            let gid = *self.layout.gids.get(neuron).ok_or_else(|| {
                corrupt_block(format!("block names neuron {}", neuron))
            })?;
            let expected = self.layout.num_compartments(neuron);
            if len != expected {
                return Err(Error::Size {
                    gid,
                    expected,
                    found: len,
                });
            }
            let start = self.starts[neuron];
            let slice = &mut frame[start..start + len];
            reader.read_f32_into::<LittleEndian>(slice)?;
            covered[neuron] = true;
        }
        Ok(())
    }
}

impl ReportReader for ContainerReader {
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
        let Some(blocks) = self.frames.get(&index) else {
            return Ok(None);
        };
        let mut frame = vec![0f32; self.layout.frame_size as usize];
        let mut covered = vec![false; self.layout.len()];
        for &(shard, position) in blocks {
            self.apply_block(shard, position, index, &mut frame, &mut covered)?;
        }
        Ok(covered.iter().all(|&c| c).then_some(frame))
    }
}
