use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

use hashbrown::HashSet;
use tracing::{trace, warn};

use super::{Envelope, FabricError, Result, Source, Tag};

/// Inbound messages of one rank, shared by the threads or tasks that
/// deliver into it.
pub(crate) struct Mailbox {
    peers: usize,
    inbox: Mutex<Inbox>,
    arrived: Condvar,
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Envelope>,
    disconnected: HashSet<usize>,
}

impl Inbox {
    /// Removes the oldest message matching `source` and `tag`.
    fn take(&mut self, source: Source, tag: Tag) -> Option<Envelope> {
        let position = self
            .queue
            .iter()
            .position(|e| e.tag == tag && source.matches(e.source))?;
        self.queue.remove(position)
    }

    /// Error for a receive that can never be satisfied.
    fn unreachable(&self, source: Source, peers: usize) -> Option<FabricError> {
        match source {
            Source::Rank(rank) if self.disconnected.contains(&rank) => {
                Some(FabricError::Disconnected(rank))
            }
            Source::Any if self.disconnected.len() >= peers => {
                let rank = self.disconnected.iter().copied().max();
                Some(rank.map_or(
                    FabricError::NoRoute(0),
                    FabricError::Disconnected,
                ))
            }
            _ => None,
        }
    }
}

impl Mailbox {
    /// A mailbox expecting messages from `peers` other ranks.
    pub(crate) fn new(peers: usize) -> Self {
        Self {
            peers,
            inbox: Mutex::new(Inbox::default()),
            arrived: Condvar::new(),
        }
    }

    /// Queues `envelope`. A poisoned inbox drops it; the receiver sees
    /// `Poisoned` on its next take.
    pub(crate) fn deliver(&self, envelope: Envelope) {
        match self.inbox.lock() {
            Ok(mut inbox) => {
                trace!(?envelope, "delivered");
                inbox.queue.push_back(envelope);
            }
            Err(_) => warn!(?envelope, "inbox poisoned, message dropped"),
        }
        self.arrived.notify_all();
    }

    /// Marks a peer as gone. Messages it already sent stay receivable.
    pub(crate) fn disconnect(&self, rank: usize) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.disconnected.insert(rank);
        }
        self.arrived.notify_all();
    }

    pub(crate) fn try_take(
        &self,
        source: Source,
        tag: Tag,
    ) -> Result<Option<Envelope>> {
        let mut inbox = self.inbox.lock().map_err(|_| FabricError::Poisoned)?;
        if let Some(envelope) = inbox.take(source, tag) {
            return Ok(Some(envelope));
        }
        match inbox.unreachable(source, self.peers) {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }

    pub(crate) fn take(&self, source: Source, tag: Tag) -> Result<Envelope> {
        let mut inbox = self.inbox.lock().map_err(|_| FabricError::Poisoned)?;
        loop {
            if let Some(envelope) = inbox.take(source, tag) {
                return Ok(envelope);
            }
            if let Some(error) = inbox.unreachable(source, self.peers) {
                return Err(error);
            }
            inbox = self
                .arrived
                .wait(inbox)
                .map_err(|_| FabricError::Poisoned)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    fn envelope(source: usize, tag: Tag, payload: i64) -> Envelope {
        Envelope {
            source,
            tag,
            payload,
        }
    }

    #[test]
    fn receives_are_fifo_per_source_and_tag() {
        let mailbox = Mailbox::new(2);
        mailbox.deliver(envelope(1, Tag::Frame, 10));
        mailbox.deliver(envelope(2, Tag::Done, 20));
        mailbox.deliver(envelope(1, Tag::Frame, 11));
        mailbox.deliver(envelope(1, Tag::Done, 12));

        let first = mailbox.take(Source::Rank(1), Tag::Frame).unwrap();
        assert_eq!(first.payload, 10);
        let done = mailbox.try_take(Source::Any, Tag::Done).unwrap().unwrap();
        assert_eq!((done.source, done.payload), (2, 20));
        let second = mailbox.take(Source::Rank(1), Tag::Frame).unwrap();
        assert_eq!(second.payload, 11);
        assert_eq!(mailbox.take(Source::Any, Tag::Done).unwrap().payload, 12);
        assert_eq!(mailbox.try_take(Source::Any, Tag::Frame).unwrap(), None);
    }

    #[test]
    fn blocked_receive_wakes_on_delivery() {
        let mailbox = Arc::new(Mailbox::new(1));
        let sender = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mailbox.deliver(envelope(1, Tag::Barrier, 0));
            })
        };
        let received = mailbox.take(Source::Rank(1), Tag::Barrier).unwrap();
        assert_eq!(received.tag, Tag::Barrier);
        sender.join().unwrap();
    }

    #[test]
    fn deliveries_to_a_poisoned_inbox_are_dropped() {
        let mailbox = Arc::new(Mailbox::new(1));
        let poisoner = mailbox.clone();
        let _ = thread::spawn(move || {
            let _inbox = poisoner.inbox.lock().unwrap();
            panic!("poison the inbox");
        })
        .join();

        mailbox.deliver(envelope(1, Tag::Done, 1));
        assert!(matches!(
            mailbox.try_take(Source::Any, Tag::Done),
            Err(FabricError::Poisoned)
        ));
    }

    #[test]
    fn disconnected_peers_fail_pending_receives() {
        let mailbox = Mailbox::new(2);
        mailbox.deliver(envelope(1, Tag::Done, 4));
        mailbox.disconnect(1);
        // already delivered messages are still handed out
        let kept = mailbox.take(Source::Rank(1), Tag::Done).unwrap();
        assert_eq!(kept.payload, 4);
        assert!(matches!(
            mailbox.take(Source::Rank(1), Tag::Done),
            Err(FabricError::Disconnected(1))
        ));
        // rank 2 may still answer
        assert_eq!(mailbox.try_take(Source::Any, Tag::Done).unwrap(), None);
        mailbox.disconnect(2);
        assert!(matches!(
            mailbox.take(Source::Any, Tag::Done),
            Err(FabricError::Disconnected(2))
        ));
    }
}
