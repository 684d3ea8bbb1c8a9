//! Assignment of frames to ranks.
//!
//! The coordinator keeps every worker busy through a `Frame`/`Done`
//! protocol: each worker starts with a pre-queue of frames, receives a new
//! frame for every completion it reports and stops on a negative index.
//! Whenever no completion is waiting the coordinator converts the next
//! frame itself.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use super::{Error, Result};
use crate::fabric::{Fabric, SendRequest, Source, Tag};

/// Frames handed to each worker before the first completion.
pub fn prequeue_depth(frames: u64) -> u64 {
    (frames >> 9).max(2)
}

pub struct Dispatcher<'f, F: Fabric + ?Sized> {
    fabric: &'f F,
    frames: u64,
    prequeue: u64,
}

impl<'f, F: Fabric + ?Sized> Dispatcher<'f, F> {
    /// Fails with [`Error::TooManyWorkers`] when the pre-queues alone would
    /// need more than `frames` frames. Every rank reaches the same verdict.
    pub fn new(fabric: &'f F, frames: u64) -> Result<Self> {
        let prequeue = prequeue_depth(frames);
        let workers = fabric.size().saturating_sub(1);
        if workers as u64 * prequeue > frames {
            return Err(Error::TooManyWorkers {
                workers,
                prequeue,
                frames,
            });
        }
        Ok(Self {
            fabric,
            frames,
            prequeue,
        })
    }

    /// Runs this rank's side of the protocol, calling `exec` for every
    /// frame assigned here. The returned settlement completes the run once
    /// the caller has flushed its output.
    pub fn dispatch(
        self,
        exec: impl FnMut(u64) -> Result<()>,
    ) -> Result<Settlement<'f, F>> {
        if self.fabric.size() == 1 {
            self.run_alone(exec)
        } else if self.fabric.is_coordinator() {
            self.coordinate(exec)
        } else {
            self.work(exec)
        }
    }

    fn run_alone(
        self,
        mut exec: impl FnMut(u64) -> Result<()>,
    ) -> Result<Settlement<'f, F>> {
        for frame in 0..self.frames {
            exec(frame)?;
        }
        Ok(Settlement::new(
            self.fabric,
            Vec::new(),
            self.frames,
            Duration::ZERO,
        ))
    }

    fn coordinate(
        self,
        mut exec: impl FnMut(u64) -> Result<()>,
    ) -> Result<Settlement<'f, F>> {
        let fabric = self.fabric;
        let size = fabric.size();
        let mut pending: HashMap<i64, SendRequest> = HashMap::new();
        let mut idle = Duration::ZERO;
        let mut local = 0;

        for worker in 1..size {
            for j in 0..self.prequeue {
                let frame = ((worker as u64 - 1) * self.prequeue + j) as i64;
                pending.insert(frame, fabric.isend(worker, Tag::Frame, frame)?);
            }
        }
        let first = (size as u64 - 1) * self.prequeue;
        debug!(
            workers = size - 1,
            prequeue = self.prequeue,
            "frames pre-queued"
        );

        for next in first..self.frames {
            match fabric.try_recv(Source::Any, Tag::Done)? {
                Some(done) => {
                    trace!(worker = done.source, frame = done.payload, "done");
                    match pending.remove(&done.payload) {
                        Some(request) => {
                            let waited = Instant::now();
                            request.wait()?;
                            idle += waited.elapsed();
                        }
                        None => warn!(
                            worker = done.source,
                            frame = done.payload,
                            "completion for a frame that was never sent"
                        ),
                    }
                    let frame = next as i64;
                    let request = fabric.isend(done.source, Tag::Frame, frame)?;
                    pending.insert(frame, request);
                }
                None => {
                    exec(next)?;
                    local += 1;
                }
            }
        }

        let mut requests: Vec<SendRequest> = pending.into_values().collect();
        for worker in 1..size {
            requests.push(fabric.isend(worker, Tag::Frame, -(worker as i64))?);
        }
        debug!(local, "all frames assigned");
        Ok(Settlement::new(fabric, requests, local, idle))
    }

    fn work(
        self,
        mut exec: impl FnMut(u64) -> Result<()>,
    ) -> Result<Settlement<'f, F>> {
        let fabric = self.fabric;
        let mut previous: Option<SendRequest> = None;
        let mut idle = Duration::ZERO;
        let mut local = 0;
        loop {
            let waited = Instant::now();
            if let Some(request) = previous.take() {
                request.wait()?;
            }
            let assigned = fabric.recv(Source::Rank(0), Tag::Frame)?;
            idle += waited.elapsed();
            if assigned.payload < 0 {
                trace!(signal = assigned.payload, "stop");
                break;
            }
            exec(assigned.payload as u64)?;
            local += 1;
            previous = Some(fabric.isend(0, Tag::Done, assigned.payload)?);
        }
        debug!(local, "worker finished");
        Ok(Settlement::new(
            fabric,
            previous.into_iter().collect(),
            local,
            idle,
        ))
    }
}

/// The tail of a dispatch: outstanding sends plus the final barrier.
#[must_use = "ranks only finish together once settled"]
pub struct Settlement<'f, F: Fabric + ?Sized> {
    fabric: &'f F,
    requests: Vec<SendRequest>,
    local_frames: u64,
    idle: Duration,
}

impl<'f, F: Fabric + ?Sized> Settlement<'f, F> {
    fn new(
        fabric: &'f F,
        requests: Vec<SendRequest>,
        local_frames: u64,
        idle: Duration,
    ) -> Self {
        Self {
            fabric,
            requests,
            local_frames,
            idle,
        }
    }

    /// Frames this rank converted.
    pub fn local_frames(&self) -> u64 {
        self.local_frames
    }

    /// Waits for every outstanding send, then for every rank. Returns the
    /// total time this rank spent blocked on the fabric.
    pub fn settle(self) -> Result<Duration> {
        let waited = Instant::now();
        for request in self.requests {
            request.wait()?;
        }
        self.fabric.barrier()?;
        Ok(self.idle + waited.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;
    use crate::fabric::LocalFabric;

    #[test]
    fn prequeue_grows_with_long_reports() {
        assert_eq!(prequeue_depth(0), 2);
        assert_eq!(prequeue_depth(1023), 2);
        assert_eq!(prequeue_depth(1536), 3);
        assert_eq!(prequeue_depth(100_000), 195);
    }

    #[test]
    fn too_many_workers_for_the_prequeue() {
        let world = LocalFabric::world(16);
        let result = Dispatcher::new(&world[3], 4);
        assert!(matches!(
            result,
            Err(Error::TooManyWorkers {
                workers: 15,
                prequeue: 2,
                frames: 4
            })
        ));
        assert!(Dispatcher::new(&world[0], 30).is_ok());
    }

    /// Runs a dispatch on every rank of a local world and returns, per
    /// rank, the frames it executed.
    fn run_world(size: usize, frames: u64) -> Vec<Vec<u64>> {
        let executed = Arc::new(Mutex::new(vec![Vec::new(); size]));
        let ranks: Vec<_> = LocalFabric::world(size)
            .into_iter()
            .map(|fabric| {
                let executed = executed.clone();
                thread::spawn(move || {
                    let rank = fabric.rank();
                    let dispatcher = Dispatcher::new(&fabric, frames).unwrap();
                    let settlement = dispatcher
                        .dispatch(|frame| {
                            executed.lock().unwrap()[rank].push(frame);
                            Ok(())
                        })
                        .unwrap();
                    let local = settlement.local_frames();
                    settlement.settle().unwrap();
                    local
                })
            })
            .collect();
        let locals: Vec<u64> =
            ranks.into_iter().map(|r| r.join().unwrap()).collect();
        let executed = executed.lock().unwrap().clone();
        for (rank, frames) in executed.iter().enumerate() {
            assert_eq!(frames.len() as u64, locals[rank]);
        }
        executed
    }

    #[test]
    fn every_frame_is_converted_exactly_once() {
        let cases = [(1, 9), (2, 2), (2, 10), (3, 4), (4, 64), (5, 1100)];
        for (size, frames) in cases {
            let executed = run_world(size, frames);
            let mut all: Vec<u64> = executed.concat();
            all.sort_unstable();
            assert_eq!(
                all,
                (0..frames).collect::<Vec<_>>(),
                "{size} ranks, {frames} frames"
            );
        }
    }

    #[test]
    fn workers_start_with_their_prequeue() {
        let executed = run_world(3, 4);
        // frames 0..4 are all pre-queued: nothing is left for the coordinator
        assert!(executed[0].is_empty());
        assert_eq!(executed[1], vec![0, 1]);
        assert_eq!(executed[2], vec![2, 3]);
    }

    #[test]
    fn errors_from_frames_stop_the_dispatch() {
        let world = LocalFabric::world(1);
        let dispatcher = Dispatcher::new(&world[0], 5).unwrap();
        let result = dispatcher.dispatch(|frame| {
            if frame == 3 {
                Err(Error::MissingFrame {
                    index: frame,
                    timestamp: 3.0,
                })
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::MissingFrame { index: 3, .. })));
    }
}
