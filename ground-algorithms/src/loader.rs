//! Single-threaded I/O in front of a [PointSource].
//!
//! Workers never touch the point source. They send [TileMessage]s to the [TileLoaderQueue] and wait on the
//! [TileSlots] for the tile buffer to show up. The queue runs on the thread that owns the point source and
//! executes the messages one after another.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ground_core::{
    containers::TileBuffer,
    source::{Channels, PointSource},
};
use log::{debug, error};

use crate::{
    error::{GroundDetectionError, Result},
    quadtree::{NodeId, Quadtree},
};

/// Maximum number of pending messages before senders have to wait
pub const DEFAULT_BACKLOG: usize = 64;
/// How long the queue waits for a message before it checks its stop predicate again
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// How long a worker sleeps between two checks of a slot
const WAIT_INTERVAL: Duration = Duration::from_millis(1);

/// A request from a worker to the tile loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMessage {
    /// Query the points of a tile and put them into its slot
    Load(NodeId),
    /// Write the classification of the buffer in the tile's slot back and release the buffer
    Save(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Idle,
    Running,
    Draining,
    Stopped,
}

const SLOT_EMPTY: u8 = 0;
const SLOT_READY: u8 = 1;
const SLOT_FAILED: u8 = 2;

/// Per tile buffers while tiles are being processed, indexed by [NodeId]
pub struct TileSlots {
    buffers: Vec<Mutex<Option<TileBuffer>>>,
    status: Vec<AtomicU8>,
}

impl TileSlots {
    /// Creates empty slots for a tree with `node_count` nodes
    pub fn new(node_count: usize) -> Self {
        Self {
            buffers: (0..node_count).map(|_| Mutex::new(None)).collect(),
            status: (0..node_count).map(|_| AtomicU8::new(SLOT_EMPTY)).collect(),
        }
    }

    /// True if the buffer of `tile` was loaded and not taken yet
    pub fn is_ready(&self, tile: NodeId) -> bool {
        self.status[tile.0].load(Ordering::Acquire) == SLOT_READY
    }

    /// Takes the loaded buffer out of the slot of `tile`
    pub fn take(&self, tile: NodeId) -> Option<TileBuffer> {
        let buffer = self.buffers[tile.0].lock().ok()?.take();
        self.status[tile.0].store(SLOT_EMPTY, Ordering::Release);
        buffer
    }

    /// Puts a (classified) buffer back into the slot of `tile`, ready to be saved
    pub fn put(&self, tile: NodeId, buffer: TileBuffer) {
        if let Ok(mut slot) = self.buffers[tile.0].lock() {
            *slot = Some(buffer);
        }
    }

    /// Spins until the buffer of `tile` was loaded, then takes it. Returns `None` if loading failed
    pub fn wait_for(&self, tile: NodeId) -> Option<TileBuffer> {
        loop {
            match self.status[tile.0].load(Ordering::Acquire) {
                SLOT_READY => return self.take(tile),
                SLOT_FAILED => {
                    self.status[tile.0].store(SLOT_EMPTY, Ordering::Release);
                    return None;
                }
                _ => thread::sleep(WAIT_INTERVAL),
            }
        }
    }

    fn store(&self, tile: NodeId, buffer: TileBuffer) {
        self.put(tile, buffer);
        self.status[tile.0].store(SLOT_READY, Ordering::Release);
    }

    fn fail(&self, tile: NodeId) {
        self.status[tile.0].store(SLOT_FAILED, Ordering::Release);
    }

    fn release(&self, tile: NodeId) -> Option<TileBuffer> {
        self.buffers[tile.0].lock().ok()?.take()
    }
}

type StopPredicate<'a> = Box<dyn Fn() -> bool + Send + Sync + 'a>;
type FailureListener<'a> = Box<dyn Fn() + Send + Sync + 'a>;

/// Bounded multi-producer, single-consumer queue of [TileMessage]s in front of a point source
pub struct TileLoaderQueue<'a> {
    tree: &'a Quadtree,
    slots: &'a TileSlots,
    sender: Sender<TileMessage>,
    receiver: Receiver<TileMessage>,
    state: Mutex<LoaderState>,
    stop: Mutex<Option<StopPredicate<'a>>>,
    on_failure: Mutex<Option<FailureListener<'a>>>,
    failure: Mutex<Option<anyhow::Error>>,
}

impl<'a> TileLoaderQueue<'a> {
    pub fn new(tree: &'a Quadtree, slots: &'a TileSlots, backlog: usize) -> Self {
        let (sender, receiver) = bounded(backlog.max(1));
        Self {
            tree,
            slots,
            sender,
            receiver,
            state: Mutex::new(LoaderState::Idle),
            stop: Mutex::new(None),
            on_failure: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(LoaderState::Stopped)
    }

    fn set_state(&self, next: LoaderState) {
        if let Ok(mut state) = self.state.lock() {
            debug!("Tile loader {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Installs the predicate that tells the queue to stop. The queue stops once the predicate holds and
    /// no message is pending. Without a predicate, the queue stops as soon as it runs out of messages
    pub fn set_stop<F: Fn() -> bool + Send + Sync + 'a>(&self, predicate: F) {
        if let Ok(mut stop) = self.stop.lock() {
            *stop = Some(Box::new(predicate));
        }
    }

    /// Installs a callback that runs on the queue thread whenever a load or save fails
    pub fn set_on_failure<F: Fn() + Send + Sync + 'a>(&self, listener: F) {
        if let Ok(mut on_failure) = self.on_failure.lock() {
            *on_failure = Some(Box::new(listener));
        }
    }

    fn should_stop(&self) -> bool {
        match self.stop.lock() {
            Ok(stop) => stop.as_ref().map_or(true, |predicate| predicate()),
            Err(_) => true,
        }
    }

    /// Enqueues a message. Waits if the backlog is full
    pub fn send(&self, message: TileMessage) -> Result<()> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => self.sender.send(message).map_err(|_| {
                GroundDetectionError::Source(anyhow::anyhow!("tile loader queue is closed"))
            }),
            Err(TrySendError::Disconnected(_)) => Err(GroundDetectionError::Source(
                anyhow::anyhow!("tile loader queue is closed"),
            )),
        }
    }

    /// Executes messages against `source` until the stop predicate holds and all pending messages are done.
    /// Must be called by the one thread that owns `source`
    pub fn run<S: PointSource + ?Sized>(&self, source: &mut S) {
        self.set_state(LoaderState::Running);
        loop {
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(message) => self.execute(message, source),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.should_stop() {
                self.set_state(LoaderState::Draining);
                while let Ok(message) = self.receiver.try_recv() {
                    self.execute(message, source);
                }
                break;
            }
        }
        self.set_state(LoaderState::Stopped);
    }

    fn execute<S: PointSource + ?Sized>(&self, message: TileMessage, source: &mut S) {
        match message {
            TileMessage::Load(tile) => {
                match source.query_points(self.tree.node(tile).region(), Channels::ALL) {
                    Ok(buffer) => self.slots.store(tile, buffer),
                    Err(why) => {
                        error!("Loading tile {} failed: {:#}", tile.index(), why);
                        self.slots.fail(tile);
                        self.record_failure(why);
                    }
                }
            }
            TileMessage::Save(tile) => {
                if let Some(buffer) = self.slots.release(tile) {
                    if let Err(why) = source.submit_classification(tile.index(), &buffer) {
                        error!("Saving tile {} failed: {:#}", tile.index(), why);
                        self.record_failure(why);
                    }
                }
            }
        }
    }

    fn record_failure(&self, why: anyhow::Error) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(why);
        }
        if let Ok(on_failure) = self.on_failure.lock() {
            if let Some(listener) = on_failure.as_ref() {
                listener();
            }
        }
    }

    /// The first point source error that happened while running, if any
    pub fn take_failure(&self) -> Option<anyhow::Error> {
        self.failure.lock().ok()?.take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use ground_core::{
        classification::PointClass,
        nalgebra::Point3,
        source::InMemoryPointSource,
    };

    use super::*;
    use crate::quadtree::SplitLimits;

    fn setup() -> (InMemoryPointSource, Quadtree, Vec<NodeId>) {
        let points: Vec<Point3<f64>> = (0..64)
            .map(|i| Point3::new((i % 8) as f64, (i / 8) as f64, 0.0))
            .collect();
        let mut source = InMemoryPointSource::new(points);
        let bounds = source.bounds().unwrap();
        let limits = SplitLimits {
            tile_size: 0.0,
            max_data_size: 16,
            max_depth: 8,
        };
        let (tree, tiles) = Quadtree::build(bounds, &mut source, limits).unwrap();
        (source, tree, tiles)
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let (mut source, tree, tiles) = setup();
        let done = AtomicBool::new(false);
        let slots = TileSlots::new(tree.len());
        let queue = TileLoaderQueue::new(&tree, &slots, 2);
        assert_eq!(queue.state(), LoaderState::Idle);

        queue.set_stop(|| done.load(Ordering::SeqCst));
        thread::scope(|scope| {
            scope.spawn(|| {
                for tile in &tiles {
                    queue.send(TileMessage::Load(*tile)).unwrap();
                    let mut buffer = slots.wait_for(*tile).unwrap();
                    let count = buffer.len();
                    buffer.set_classification(vec![PointClass::Ground; count]);
                    slots.put(*tile, buffer);
                    queue.send(TileMessage::Save(*tile)).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
            queue.run(&mut source);
        });

        assert_eq!(queue.state(), LoaderState::Stopped);
        assert_eq!(source.submitted_tiles().len(), tiles.len());
        assert!(source.classification().iter().all(|c| c.is_ground()));
        assert!(queue.take_failure().is_none());
    }

    #[test]
    fn test_many_senders_with_small_backlog() {
        let (mut source, tree, tiles) = setup();
        let finished = AtomicUsize::new(0);
        let workers = 3;
        let slots = TileSlots::new(tree.len());
        let queue = TileLoaderQueue::new(&tree, &slots, 1);
        queue.set_stop(|| finished.load(Ordering::SeqCst) == workers);
        thread::scope(|scope| {
            for worker in 0..workers {
                let (queue, slots, tiles, finished) = (&queue, &slots, &tiles, &finished);
                scope.spawn(move || {
                    for (idx, tile) in tiles.iter().enumerate() {
                        if idx % workers != worker {
                            continue;
                        }
                        queue.send(TileMessage::Load(*tile)).unwrap();
                        let buffer = slots.wait_for(*tile).unwrap();
                        slots.put(*tile, buffer);
                        queue.send(TileMessage::Save(*tile)).unwrap();
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
            queue.run(&mut source);
        });
        let mut submitted = source.submitted_tiles().to_vec();
        submitted.sort_unstable();
        let mut expected: Vec<usize> = tiles.iter().map(|t| t.index()).collect();
        expected.sort_unstable();
        assert_eq!(submitted, expected);
    }

    #[test]
    fn test_without_predicate_stops_when_empty() {
        let (mut source, tree, tiles) = setup();
        let slots = TileSlots::new(tree.len());
        let queue = TileLoaderQueue::new(&tree, &slots, DEFAULT_BACKLOG);
        queue.send(TileMessage::Load(tiles[0])).unwrap();
        queue.run(&mut source);
        assert!(slots.is_ready(tiles[0]));
        assert_eq!(slots.take(tiles[0]).unwrap().len(), 16);
        assert!(!slots.is_ready(tiles[0]));
    }
}
