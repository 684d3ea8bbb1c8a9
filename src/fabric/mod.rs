//! Message passing between the ranks of a conversion.
//!
//! A fabric exchanges small tagged integers between ranks. Rank 0 is the
//! coordinator. [`LocalFabric`] runs every rank as a thread of one process,
//! [`QuicFabric`] runs one process per rank over QUIC links to the
//! coordinator.

use tokio::sync::oneshot;

mod error;
mod local;
mod mailbox;
mod quic;
mod wire;

pub use error::{FabricError, Result};
pub use local::LocalFabric;
pub use quic::{QuicConfig, QuicFabric};

/// Kind of a message. Receives select on it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Coordinator to worker: frame index to process, negative to stop.
    Frame = 1,
    /// Worker to coordinator: index of a completed frame.
    Done = 2,
    Barrier = 3,
    /// First message of a worker on a new link, carrying its rank.
    Hello = 4,
}

impl TryFrom<u8> for Tag {
    type Error = FabricError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Frame),
            2 => Ok(Self::Done),
            3 => Ok(Self::Barrier),
            4 => Ok(Self::Hello),
            other => Err(FabricError::Malformed(other)),
        }
    }
}

/// A received message together with the rank that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub payload: i64,
}

/// Which senders a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(usize),
}

impl Source {
    pub fn matches(self, rank: usize) -> bool {
        match self {
            Self::Any => true,
            Self::Rank(r) => r == rank,
        }
    }
}

/// Handle on a non-blocking send.
#[must_use = "a send is only known to have completed once waited on"]
#[derive(Debug)]
pub struct SendRequest(Option<oneshot::Receiver<Result<()>>>);

impl SendRequest {
    /// A send that finished before `isend` returned.
    pub fn complete() -> Self {
        Self(None)
    }

    pub(crate) fn pending(completion: oneshot::Receiver<Result<()>>) -> Self {
        Self(Some(completion))
    }

    /// Blocks until the message has been handed to the transport.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<()> {
        match self.0 {
            None => Ok(()),
            Some(completion) => completion
                .blocking_recv()
                .map_err(|_| FabricError::Abandoned)?,
        }
    }
}

/// Point-to-point messaging among `size()` ranks.
///
/// Messages between one pair of ranks with the same tag are received in
/// the order they were sent.
pub trait Fabric: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn isend(&self, dest: usize, tag: Tag, payload: i64) -> Result<SendRequest>;

    /// Receives a matching message if one has already arrived.
    fn try_recv(&self, source: Source, tag: Tag) -> Result<Option<Envelope>>;

    /// Blocks until a matching message arrives.
    fn recv(&self, source: Source, tag: Tag) -> Result<Envelope>;

    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

/// Barrier over messages: workers report to rank 0, which releases them
/// once all have arrived. A peer lost on the way fails the barrier.
pub(crate) fn star_barrier<F: Fabric + ?Sized>(fabric: &F) -> Result<()> {
    let size = fabric.size();
    if size == 1 {
        return Ok(());
    }
    if fabric.is_coordinator() {
        for peer in 1..size {
            fabric.recv(Source::Rank(peer), Tag::Barrier)?;
        }
        for peer in 1..size {
            fabric.isend(peer, Tag::Barrier, 0)?.wait()?;
        }
    } else {
        fabric.isend(0, Tag::Barrier, 0)?.wait()?;
        fabric.recv(Source::Rank(0), Tag::Barrier)?;
    }
    Ok(())
}

impl<F: Fabric + ?Sized> Fabric for Box<F> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn isend(
        &self,
        dest: usize,
        tag: Tag,
        payload: i64,
    ) -> Result<SendRequest> {
        (**self).isend(dest, tag, payload)
    }

    fn try_recv(&self, source: Source, tag: Tag) -> Result<Option<Envelope>> {
        (**self).try_recv(source, tag)
    }

    fn recv(&self, source: Source, tag: Tag) -> Result<Envelope> {
        (**self).recv(source, tag)
    }

    fn barrier(&self) -> Result<()> {
        (**self).barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_survive_their_byte_form() {
        for tag in [Tag::Frame, Tag::Done, Tag::Barrier, Tag::Hello] {
            assert_eq!(Tag::try_from(tag as u8).unwrap(), tag);
        }
        assert!(matches!(Tag::try_from(0), Err(FabricError::Malformed(0))));
    }

    #[test]
    fn pending_sends_report_their_outcome() {
        let (tx, rx) = oneshot::channel();
        tx.send(Err(FabricError::Disconnected(3))).unwrap();
        assert!(matches!(
            SendRequest::pending(rx).wait(),
            Err(FabricError::Disconnected(3))
        ));

        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        assert!(matches!(
            SendRequest::pending(rx).wait(),
            Err(FabricError::Abandoned)
        ));
        SendRequest::complete().wait().unwrap();
    }
}
