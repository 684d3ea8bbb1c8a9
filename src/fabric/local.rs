use std::sync::Arc;

use tracing::trace;

use super::{
    mailbox::Mailbox, Envelope, Fabric, FabricError, Result, SendRequest,
    Source, Tag,
};

/// One rank of a world whose ranks are threads of this process.
pub struct LocalFabric {
    rank: usize,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl LocalFabric {
    /// Creates every rank of a world of `size`. Hand one to each thread.
    pub fn world(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let mailboxes: Arc<Vec<Mailbox>> =
            Arc::new((0..size).map(|_| Mailbox::new(size - 1)).collect());
        (0..size)
            .map(|rank| Self {
                rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailboxes[self.rank]
    }
}

impl Fabric for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn isend(
        &self,
        dest: usize,
        tag: Tag,
        payload: i64,
    ) -> Result<SendRequest> {
        let mailbox =
            self.mailboxes.get(dest).ok_or(FabricError::NoRoute(dest))?;
        trace!(rank = self.rank, dest, ?tag, payload, "local send");
        mailbox.deliver(Envelope {
            source: self.rank,
            tag,
            payload,
        });
        Ok(SendRequest::complete())
    }

    fn try_recv(&self, source: Source, tag: Tag) -> Result<Option<Envelope>> {
        self.mailbox().try_take(source, tag)
    }

    fn recv(&self, source: Source, tag: Tag) -> Result<Envelope> {
        self.mailbox().take(source, tag)
    }

    fn barrier(&self) -> Result<()> {
        super::star_barrier(self)
    }
}

impl Drop for LocalFabric {
    fn drop(&mut self) {
        for (rank, mailbox) in self.mailboxes.iter().enumerate() {
            if rank != self.rank {
                mailbox.disconnect(self.rank);
            }
        }
    }
}
