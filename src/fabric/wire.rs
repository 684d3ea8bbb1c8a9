//! Fixed-size message frames: `tag u8 | payload i64 LE`.

use byteorder::{ByteOrder, LittleEndian};

use super::{Envelope, Result, Tag};

pub(crate) const FRAME_LEN: usize = 9;

pub(crate) fn encode(tag: Tag, payload: i64) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = tag as u8;
    LittleEndian::write_i64(&mut buf[1..], payload);
    buf
}

pub(crate) fn decode(source: usize, buf: &[u8; FRAME_LEN]) -> Result<Envelope> {
    Ok(Envelope {
        source,
        tag: Tag::try_from(buf[0])?,
        payload: LittleEndian::read_i64(&buf[1..]),
    })
}
