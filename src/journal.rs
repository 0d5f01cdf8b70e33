//! # Journal and Watch Dispatch
//!
//! The journal is the in-process event broker. Transactions stage
//! `(envelope, model, [updated])` entries into a spill list; on commit the
//! journal hands every registered watch an independent reader over that
//! list. Each watch owns one background dispatch thread that forwards
//! events to its handler, serially:
//!
//! ```text
//! started(id) → created()* → parity() → (created|updated|deleted)* → end()
//!               └ snapshot ┘            └ live, in commit order ┘
//! ```
//!
//! ## Backpressure
//!
//! A watch's inbound queue is bounded. When fan-out finds it full the
//! delivery is dropped and the watch's overflow counter advances; the
//! dispatch thread converts counter advances into
//! [`EventHandler::error`]`(QueueOverflow)` at its next scheduling point.
//! Slow subscribers lose deliveries, observably, and never stall
//! committers.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Record;
use crate::spill::{Iter, List};

/// Capacity of each watch's inbound queue of staged-list readers.
pub(crate) const QUEUE_DEPTH: usize = 250;

// =============================================================================
// Serial Numbers
// =============================================================================
// Process-wide: event ids stay strictly increasing across every journal in
// the process, watch ids likewise.

static WATCH_SERIAL: AtomicU64 = AtomicU64::new(0);
static EVENT_SERIAL: AtomicU64 = AtomicU64::new(0);

fn next_watch_id() -> u64 {
    WATCH_SERIAL.fetch_add(1, Ordering::Relaxed) + 1
}

// =============================================================================
// Events
// =============================================================================

/// What happened, from the handler's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// The watch has started.
    Started,
    /// The initial snapshot has been fully delivered.
    Parity,
    /// A delivery error occurred.
    Error,
    /// The watch has ended.
    End,
    /// A record was created.
    Created,
    /// A record was updated.
    Updated,
    /// A record was deleted.
    Deleted,
}

/// The staged form of an event: what precedes the model entry (and, for
/// updates, the post-image entry) in a spill list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: u64,
    pub action: Action,
    pub kind: String,
}

/// A delivered event.
///
/// For [`Action::Updated`], `model` is the pre-image and `updated` the
/// post-image; for other actions only `model` is set.
#[derive(Clone, Debug)]
pub struct Event<M> {
    /// Journal-issued id, strictly increasing within the process.
    pub id: u64,
    /// What happened.
    pub action: Action,
    /// The event subject.
    pub model: M,
    /// The post-image, for updates.
    pub updated: Option<M>,
}

// =============================================================================
// Handler
// =============================================================================

/// Watch behavior declared by the handler.
#[derive(Clone, Copy, Debug)]
pub struct WatchOptions {
    /// Whether the watch begins with a snapshot of existing records.
    pub snapshot: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { snapshot: true }
    }
}

/// Receives a watch's events, serially, on the watch's dispatch thread.
///
/// All methods default to no-ops so handlers implement only what they need.
pub trait EventHandler<M: Record>: Send + 'static {
    /// Declares watch behavior. Defaults to snapshot delivery.
    fn options(&self) -> WatchOptions {
        WatchOptions::default()
    }

    /// The watch has started.
    fn started(&mut self, _watch_id: u64) {}

    /// The initial set of `created` events has been delivered.
    fn parity(&mut self) {}

    /// A record has been created.
    fn created(&mut self, _event: Event<M>) {}

    /// A record has been updated.
    fn updated(&mut self, _event: Event<M>) {}

    /// A record has been deleted.
    fn deleted(&mut self, _event: Event<M>) {}

    /// An error occurred delivering events. The watch stays running.
    fn error(&mut self, _err: &Error) {}

    /// The watch has ended.
    fn end(&mut self) {}
}

// =============================================================================
// Watch
// =============================================================================

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

#[derive(Default)]
struct WatchShared {
    state: AtomicU8,
    overflow: AtomicU64,
}

/// One subscription: a kind, a handler, and delivery state.
///
/// Returned by [`Db::watch`](crate::Db::watch); ending it (or closing the
/// journal) lets the dispatch thread finish draining and call
/// [`EventHandler::end`].
pub struct Watch {
    id: u64,
    kind: &'static str,
    shared: Arc<WatchShared>,
    journal: Journal,
}

impl Watch {
    /// The watch id, as passed to [`EventHandler::started`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The kind this watch delivers.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Whether the watch has not yet stopped.
    pub fn alive(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != STATE_STOPPED
    }

    /// Ends the watch. The dispatch thread drains queued deliveries, calls
    /// the handler's `end`, and stops.
    pub fn end(&self) {
        self.journal.end(self.id);
    }
}

struct WatchEntry {
    id: u64,
    kind: &'static str,
    queue: Sender<Iter>,
    shared: Arc<WatchShared>,
}

// =============================================================================
// Journal
// =============================================================================

/// The in-process event broker: the set of live watches.
#[derive(Clone, Default)]
pub(crate) struct Journal {
    watches: Arc<RwLock<Vec<WatchEntry>>>,
}

impl Journal {
    /// Issues the next event id.
    pub(crate) fn next_event_id(&self) -> u64 {
        EVENT_SERIAL.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether any watch matches the kind.
    ///
    /// Staging is skipped entirely when nothing is listening.
    pub(crate) fn has_watch(&self, kind: &str) -> bool {
        self.watches.read().iter().any(|entry| entry.kind == kind)
    }

    /// Registers a watch for `M` and returns its handle plus the
    /// not-yet-started dispatcher.
    pub(crate) fn subscribe<M, H>(&self, handler: H) -> (Watch, Dispatcher<M, H>)
    where
        M: Record,
        H: EventHandler<M>,
    {
        let id = next_watch_id();
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let shared = Arc::new(WatchShared::default());
        self.watches.write().push(WatchEntry {
            id,
            kind: M::kind(),
            queue: tx,
            shared: shared.clone(),
        });
        debug!(watch = id, kind = M::kind(), "watch created");
        (
            Watch {
                id,
                kind: M::kind(),
                shared: shared.clone(),
                journal: self.clone(),
            },
            Dispatcher {
                id,
                handler,
                queue: rx,
                shared,
                _kind: PhantomData,
            },
        )
    }

    /// Removes a watch. Dropping its queue sender closes the channel; the
    /// dispatch thread finishes draining and stops.
    pub(crate) fn end(&self, id: u64) {
        let mut watches = self.watches.write();
        let before = watches.len();
        watches.retain(|entry| entry.id != id);
        if watches.len() != before {
            debug!(watch = id, "watch end requested");
        }
    }

    /// Ends every watch.
    pub(crate) fn close(&self) {
        let mut watches = self.watches.write();
        let ended = watches.len();
        watches.clear();
        debug!(ended, "journal closed");
    }

    /// Fans a committed staged list out to every watch.
    ///
    /// Called with the writer slot still held, so staged lists arrive in
    /// commit order. Sends never block: a full queue drops the delivery and
    /// advances the watch's overflow counter.
    pub(crate) fn report(&self, staged: List) {
        if staged.is_empty() {
            return;
        }
        let watches = self.watches.read();
        for entry in watches.iter() {
            match entry.queue.try_send(staged.iter()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    entry.shared.overflow.fetch_add(1, Ordering::Relaxed);
                    warn!(watch = entry.id, "queue full, delivery dropped");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The not-yet-started delivery side of a watch.
///
/// `start` consumes it into a background thread that owns the handler.
pub(crate) struct Dispatcher<M: Record, H: EventHandler<M>> {
    id: u64,
    handler: H,
    queue: Receiver<Iter>,
    shared: Arc<WatchShared>,
    _kind: PhantomData<fn() -> M>,
}

impl<M: Record, H: EventHandler<M>> Dispatcher<M, H> {
    /// Spawns the dispatch thread, seeded with the snapshot iterator.
    pub(crate) fn start(self, snapshot: Iter) -> Result<()> {
        let name = format!("watch-{}", self.id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run(snapshot))?;
        Ok(())
    }

    fn run(mut self, mut snapshot: Iter) {
        self.shared.state.store(STATE_RUNNING, Ordering::Release);
        debug!(watch = self.id, "watch started");
        self.handler.started(self.id);
        self.drain(&mut snapshot);
        snapshot.close();
        self.handler.parity();
        let mut reported = 0u64;
        loop {
            self.surface_overflow(&mut reported);
            match self.queue.recv() {
                Ok(mut iter) => self.drain(&mut iter),
                Err(_) => break,
            }
        }
        self.surface_overflow(&mut reported);
        self.handler.end();
        self.shared.state.store(STATE_STOPPED, Ordering::Release);
        debug!(watch = self.id, "watch stopped");
    }

    /// Converts fan-out drops into handler-visible errors.
    fn surface_overflow(&mut self, reported: &mut u64) {
        let seen = self.shared.overflow.load(Ordering::Relaxed);
        while *reported < seen {
            self.handler.error(&Error::QueueOverflow);
            *reported += 1;
        }
    }

    /// Walks one staged list, forwarding matching events to the handler.
    fn drain(&mut self, iter: &mut Iter) {
        loop {
            let envelope = match iter.next_as::<Envelope>() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => {
                    self.handler.error(&err);
                    break;
                }
            };
            // Foreign kinds pass through unparsed.
            if envelope.kind != M::kind() {
                if !self.skip_entry(iter) {
                    break;
                }
                if envelope.action == Action::Updated && !self.skip_entry(iter) {
                    break;
                }
                continue;
            }
            let Some(model) = self.read_model(iter) else {
                break;
            };
            let updated = if envelope.action == Action::Updated {
                let Some(updated) = self.read_model(iter) else {
                    break;
                };
                Some(updated)
            } else {
                None
            };
            let event = Event {
                id: envelope.id,
                action: envelope.action,
                model,
                updated,
            };
            match envelope.action {
                Action::Created => self.handler.created(event),
                Action::Updated => self.handler.updated(event),
                Action::Deleted => self.handler.deleted(event),
                _ => self
                    .handler
                    .error(&Error::Spill("unexpected staged action".to_string())),
            }
        }
    }

    fn read_model(&mut self, iter: &mut Iter) -> Option<M> {
        match iter.next_as::<M>() {
            Ok(Some(model)) => Some(model),
            Ok(None) => {
                self.handler
                    .error(&Error::Spill("model expected after event".to_string()));
                None
            }
            Err(err) => {
                self.handler.error(&err);
                None
            }
        }
    }

    fn skip_entry(&mut self, iter: &mut Iter) -> bool {
        match iter.skip() {
            Ok(true) => true,
            Ok(false) => {
                self.handler
                    .error(&Error::Spill("model expected after event".to_string()));
                false
            }
            Err(err) => {
                self.handler.error(&err);
                false
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
