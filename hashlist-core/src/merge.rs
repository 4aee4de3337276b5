//! Two-level concurrent k-way merge.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   bounded    ┌─────────────┐   bounded    ┌─────────────┐
//! │ Lane 0     │──────────────│             │              │             │
//! │ (segments) │   queue 0    │ Coordinator │──────────────│ MergeStream │
//! ├────────────┤              │ (1 thread)  │  final queue │  (caller)   │
//! │ Lane N-1   │──────────────│             │              │             │
//! └────────────┘   queue N-1  └─────────────┘              └─────────────┘
//! ```
//!
//! Each lane owns a contiguous subset of the sources and merges them with a
//! local min-heap. The coordinator merges the lane streams the same way. Both
//! levels run the same heap merge: the coordinator sees each lane as just another
//! [`RecordSource`].
//!
//! # Termination and Failure
//!
//! Queues carry `Result<Message>`. `Message::End` closes a stream; `Err`
//! carries a failure downstream, after which the sender stops. When a
//! receiver is dropped every upstream `send` fails and the upstream thread
//! exits, so no thread stays blocked on a peer that has gone away.

use crate::error::SortError;
use crate::partition::split_even;
use crate::record::{Key, Record};
use crate::segment::RecordSource;
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::ops::Range;
use std::thread::{self, JoinHandle};

/// Item carried by every merge queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Next record in ascending key order
    Record(Record),
    /// No more records will follow
    End,
}

type Slot = Result<Message>;

/// A record tagged with the source it came from.
///
/// Ordered by key only; equal keys from different sources compare equal.
#[derive(Debug)]
struct Candidate {
    key: Key,
    record: Record,
    source: usize,
}

impl Candidate {
    fn new(record: Record, source: usize) -> Self {
        Self { key: record.key(), record, source }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Outcome of pushing a merged stream into a queue
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    /// Every record was sent
    Complete,
    /// The receiver went away first
    Abandoned,
}

/// Merges ascending `sources` into `output`, smallest key first.
///
/// Seeds a min-heap with one record per source. Each popped record is
/// replaced by the next one from the same source before it is emitted; a
/// drained source simply stops contributing.
fn kway_merge<S: RecordSource>(sources: &mut [S], output: &Sender<Slot>) -> Result<Delivery> {
    let mut heap = BinaryHeap::with_capacity(sources.len());

    for (source, input) in sources.iter_mut().enumerate() {
        if let Some(record) = input.pull()? {
            heap.push(Reverse(Candidate::new(record, source)));
        }
    }

    while let Some(Reverse(Candidate { record, source, .. })) = heap.pop() {
        if let Some(next) = sources[source].pull()? {
            heap.push(Reverse(Candidate::new(next, source)));
        }

        if output.send(Ok(Message::Record(record))).is_err() {
            return Ok(Delivery::Abandoned);
        }
    }

    Ok(Delivery::Complete)
}

/// Coordinator-side view of one lane queue
struct LaneInput {
    lane: usize,
    receiver: Receiver<Slot>,
    ended: bool,
}

impl RecordSource for LaneInput {
    fn pull(&mut self) -> Result<Option<Record>> {
        if self.ended {
            return Ok(None);
        }

        match self.receiver.recv() {
            Ok(Ok(Message::Record(record))) => Ok(Some(record)),
            Ok(Ok(Message::End)) => {
                self.ended = true;
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SortError::LaneDisconnected { lane: self.lane }.into()),
        }
    }
}

struct Lane {
    receiver: Receiver<Slot>,
    handle: JoinHandle<()>,
}

/// Fans sources out over lane threads and merges them into one stream
#[derive(Debug, Clone, Copy)]
pub struct MergeEngine {
    threads: usize,
    queue_capacity: usize,
}

impl MergeEngine {
    /// Engine using at most `threads` lanes and a final queue of
    /// `queue_capacity` records (both floored to 1)
    pub fn new(threads: usize, queue_capacity: usize) -> Self {
        Self { threads: threads.max(1), queue_capacity: queue_capacity.max(1) }
    }

    /// Contiguous source index ranges, one per lane.
    ///
    /// There are `min(threads, sources)` lanes; the last takes the remainder.
    pub fn lane_assignments(&self, sources: usize) -> Vec<Range<usize>> {
        split_even(sources, self.threads.min(sources))
    }

    /// Capacity of each lane queue when `lanes` lanes share the budget
    pub fn lane_queue_capacity(&self, lanes: usize) -> usize {
        (self.queue_capacity / lanes.max(1)).max(1)
    }

    /// Starts every lane and the coordinator; returns the final stream.
    ///
    /// All `lanes + 1` threads are spawned up front. With no sources the
    /// stream ends immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned. Threads already
    /// started exit on their own once their queues are dropped.
    pub fn start<S>(&self, sources: Vec<S>) -> Result<MergeStream>
    where
        S: RecordSource + 'static,
    {
        let assignments = self.lane_assignments(sources.len());
        let lane_capacity = self.lane_queue_capacity(assignments.len());

        let mut sources = sources.into_iter();
        let mut lanes = Vec::with_capacity(assignments.len());

        for (lane, range) in assignments.iter().enumerate() {
            let lane_sources: Vec<S> = sources.by_ref().take(range.len()).collect();
            let (tx, rx) = bounded(lane_capacity);

            let handle = thread::Builder::new()
                .name(format!("merge-lane-{lane}"))
                .spawn(move || run_lane(lane, lane_sources, &tx))
                .with_context(|| format!("Failed to spawn merge lane {lane}"))?;

            lanes.push(Lane { receiver: rx, handle });
        }

        let (tx, rx) = bounded(self.queue_capacity);
        let coordinator = thread::Builder::new()
            .name("merge-coordinator".to_string())
            .spawn(move || coordinate(lanes, &tx))
            .context("Failed to spawn merge coordinator")?;

        debug!(
            "Merge started: {} lanes, lane queue {}, final queue {}",
            assignments.len(),
            lane_capacity,
            self.queue_capacity
        );

        Ok(MergeStream {
            receiver: Some(rx),
            coordinator: Some(coordinator),
            finished: false,
            delivered: 0,
        })
    }
}

fn run_lane<S: RecordSource>(lane: usize, mut sources: Vec<S>, output: &Sender<Slot>) {
    debug!("Merge lane {lane} started with {} sources", sources.len());

    match kway_merge(&mut sources, output) {
        Ok(Delivery::Complete) => {
            let _ = output.send(Ok(Message::End));
            debug!("Merge lane {lane} finished");
        }
        Ok(Delivery::Abandoned) => debug!("Merge lane {lane} stopped: coordinator gone"),
        Err(e) => {
            let _ = output.send(Err(e.context(format!("Merge lane {lane} failed"))));
        }
    }
}

fn coordinate(lanes: Vec<Lane>, output: &Sender<Slot>) {
    let (mut inputs, handles): (Vec<LaneInput>, Vec<JoinHandle<()>>) = lanes
        .into_iter()
        .enumerate()
        .map(|(lane, Lane { receiver, handle })| {
            (LaneInput { lane, receiver, ended: false }, handle)
        })
        .unzip();

    match kway_merge(&mut inputs, output) {
        Ok(Delivery::Complete) => {
            let _ = output.send(Ok(Message::End));
        }
        Ok(Delivery::Abandoned) => debug!("Merge coordinator stopped: consumer gone"),
        Err(e) => {
            let _ = output.send(Err(e));
        }
    }

    // Unblocks lanes still waiting to send
    drop(inputs);

    for (lane, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            error!("Merge lane {lane} panicked");
        }
    }
}

/// Final ascending stream of a running merge.
///
/// Dropping the stream early stops the merge and joins its threads.
pub struct MergeStream {
    receiver: Option<Receiver<Slot>>,
    coordinator: Option<JoinHandle<()>>,
    finished: bool,
    delivered: u64,
}

impl MergeStream {
    /// Blocks for the next record; `None` once the merge has completed
    ///
    /// # Errors
    ///
    /// Returns the first failure of any lane or of the coordinator. The
    /// stream is finished afterwards.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };

        match receiver.recv() {
            Ok(Ok(Message::Record(record))) => {
                self.delivered += 1;
                Ok(Some(record))
            }
            Ok(Ok(Message::End)) => {
                self.finished = true;
                self.join()?;
                Ok(None)
            }
            Ok(Err(e)) => {
                self.finished = true;
                self.shutdown();
                Err(e)
            }
            Err(_) => {
                self.finished = true;
                self.shutdown();
                Err(SortError::Disconnected.into())
            }
        }
    }

    /// Records handed out so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn join(&mut self) -> Result<()> {
        drop(self.receiver.take());
        if let Some(handle) = self.coordinator.take() {
            handle.join().map_err(|_| anyhow!("Merge coordinator panicked"))?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.join() {
            error!("{e:#}");
        }
    }
}

impl Iterator for MergeStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl Drop for MergeStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{KEY_OFFSET, RECORD_SIZE};
    use std::collections::VecDeque;

    fn record_with_key(key: u64) -> Record {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[KEY_OFFSET..].copy_from_slice(&key.to_be_bytes()[2..]);
        Record::new(bytes)
    }

    fn key_of(record: &Record) -> u64 {
        record.key().iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    struct VecSource(VecDeque<Record>);

    impl VecSource {
        fn ascending(keys: impl IntoIterator<Item = u64>) -> Self {
            let mut keys: Vec<u64> = keys.into_iter().collect();
            keys.sort_unstable();
            Self(keys.into_iter().map(record_with_key).collect())
        }
    }

    impl RecordSource for VecSource {
        fn pull(&mut self) -> Result<Option<Record>> {
            Ok(self.0.pop_front())
        }
    }

    /// Yields `ok` records then fails
    struct FailingSource {
        ok: u64,
        pulled: u64,
    }

    impl RecordSource for FailingSource {
        fn pull(&mut self) -> Result<Option<Record>> {
            if self.pulled == self.ok {
                return Err(SortError::io("/dev/broken")(std::io::Error::other("disk gone")).into());
            }
            self.pulled += 1;
            Ok(Some(record_with_key(self.pulled)))
        }
    }

    enum TestSource {
        Vec(VecSource),
        Failing(FailingSource),
    }

    impl RecordSource for TestSource {
        fn pull(&mut self) -> Result<Option<Record>> {
            match self {
                TestSource::Vec(s) => s.pull(),
                TestSource::Failing(s) => s.pull(),
            }
        }
    }

    fn drain(stream: MergeStream) -> Vec<u64> {
        stream.map(|r| key_of(&r.unwrap())).collect()
    }

    #[test]
    fn test_lane_assignments() {
        let engine = MergeEngine::new(3, 16);
        assert_eq!(engine.lane_assignments(7), vec![0..2, 2..4, 4..7]);
        assert_eq!(engine.lane_assignments(2), vec![0..1, 1..2]);
        assert!(engine.lane_assignments(0).is_empty());
    }

    #[test]
    fn test_lane_queue_capacity_floor() {
        let engine = MergeEngine::new(8, 4);
        assert_eq!(engine.lane_queue_capacity(8), 1);
        assert_eq!(engine.lane_queue_capacity(2), 2);
        assert_eq!(MergeEngine::new(0, 0).lane_queue_capacity(3), 1);
    }

    #[test]
    fn test_candidate_heap_pops_smallest_key() {
        let mut heap = BinaryHeap::new();
        for (source, key) in [(0, 30), (1, 10), (2, 20)] {
            heap.push(Reverse(Candidate::new(record_with_key(key), source)));
        }
        assert_eq!(heap.pop().unwrap().0.source, 1);
        assert_eq!(heap.pop().unwrap().0.source, 2);
        assert_eq!(heap.pop().unwrap().0.source, 0);
    }

    #[test]
    fn test_merge_interleaved_sources() {
        let sources = vec![
            VecSource::ascending((0..100).map(|k| k * 3)),
            VecSource::ascending((0..100).map(|k| k * 3 + 1)),
            VecSource::ascending((0..100).map(|k| k * 3 + 2)),
            VecSource::ascending([1000, 2000]),
            VecSource::ascending([5]),
        ];
        let stream = MergeEngine::new(2, 8).start(sources).unwrap();

        let mut expected: Vec<u64> = (0..300).collect();
        expected.extend([5, 1000, 2000]);
        expected.sort_unstable();
        assert_eq!(drain(stream), expected);
    }

    #[test]
    fn test_more_threads_than_sources() {
        let sources = vec![VecSource::ascending([4, 2]), VecSource::ascending([3, 1])];
        let stream = MergeEngine::new(16, 1).start(sources).unwrap();
        assert_eq!(drain(stream), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_single_source() {
        let stream = MergeEngine::new(4, 4).start(vec![VecSource::ascending(0..17)]).unwrap();
        assert_eq!(drain(stream), (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_sources_ends_immediately() {
        let mut stream = MergeEngine::new(4, 4).start(Vec::<VecSource>::new()).unwrap();
        assert!(stream.next_record().unwrap().is_none());
        assert!(stream.next_record().unwrap().is_none());
        assert_eq!(stream.delivered(), 0);
    }

    #[test]
    fn test_empty_sources_are_skipped() {
        let sources = vec![
            VecSource::ascending([]),
            VecSource::ascending([7, 9]),
            VecSource::ascending([]),
        ];
        let stream = MergeEngine::new(3, 2).start(sources).unwrap();
        assert_eq!(drain(stream), vec![7, 9]);
    }

    #[test]
    fn test_duplicate_keys_are_all_delivered() {
        let sources = vec![VecSource::ascending([1, 2, 2]), VecSource::ascending([2, 3])];
        let stream = MergeEngine::new(2, 2).start(sources).unwrap();
        assert_eq!(drain(stream), vec![1, 2, 2, 2, 3]);
    }

    #[test]
    fn test_lane_failure_reaches_consumer() {
        let sources = vec![
            TestSource::Vec(VecSource::ascending(0..10_000)),
            TestSource::Failing(FailingSource { ok: 50, pulled: 0 }),
            TestSource::Vec(VecSource::ascending(0..10_000)),
        ];
        let mut stream = MergeEngine::new(3, 4).start(sources).unwrap();

        let err = loop {
            match stream.next_record() {
                Ok(Some(_)) => {}
                Ok(None) => panic!("merge completed despite a failing lane"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err.downcast_ref::<SortError>(), Some(SortError::Io { .. })));
        assert!(format!("{err:#}").contains("Merge lane 1 failed"));
        assert!(stream.next_record().unwrap().is_none());
    }

    #[test]
    fn test_dropping_stream_early_does_not_hang() {
        let sources: Vec<VecSource> =
            (0..6).map(|s| VecSource::ascending((0..5_000).map(|k| k * 6 + s))).collect();
        let mut stream = MergeEngine::new(3, 2).start(sources).unwrap();

        assert_eq!(key_of(&stream.next_record().unwrap().unwrap()), 0);
        drop(stream);
    }
}
