//! Single-threaded reactor.
//!
//! The loop does not own application state. A context type implementing
//! [`LoopContext`] owns the [`Loop`] and receives readiness through
//! [`LoopContext::on_io`]; queued events get `&mut` access to the whole
//! context when they run. Only [`LoopHandle::schedule`] may be used from
//! other threads.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::queue::{Event, MultiQueue, QueueId};

/// An event handed over from another thread.
pub type ThreadEvent<C> = Box<dyn FnOnce(&mut C) + Send>;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// How long one poll may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Poll without blocking.
    Immediate,
    /// Block at most this long.
    After(Duration),
    /// Block until something happens.
    Forever,
}

impl Timeout {
    /// Millisecond convention: `0` polls, negative waits indefinitely.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::Immediate,
            ms if ms < 0 => Self::Forever,
            ms => Self::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    fn cap(self, limit: Duration) -> Self {
        match self {
            Self::Immediate => Self::Immediate,
            Self::After(d) => Self::After(d.min(limit)),
            Self::Forever => Self::After(limit),
        }
    }

    fn as_option(self) -> Option<Duration> {
        match self {
            Self::Immediate => Some(Duration::ZERO),
            Self::After(d) => Some(d),
            Self::Forever => None,
        }
    }
}

/// One readiness notification for a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Handle returned by [`Loop::start_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// State owned by the loop's driver.
pub trait LoopContext: Sized + 'static {
    /// The loop driving this context.
    fn event_loop(&mut self) -> &mut Loop<Self>;

    /// Called once per readiness notification, before queued events run.
    fn on_io(&mut self, readiness: Readiness);

    /// Called once per loop iteration after I/O dispatch.
    fn on_tick(&mut self) {}
}

struct Shared<C> {
    queue: Mutex<VecDeque<ThreadEvent<C>>>,
    waker: Waker,
}

/// Cross-thread handle for scheduling work onto a [`Loop`].
pub struct LoopHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for LoopHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> LoopHandle<C> {
    /// Queue `event` to run on the loop thread and wake the loop.
    ///
    /// The event runs at the end of the next loop iteration.
    pub fn schedule(&self, event: ThreadEvent<C>) -> io::Result<()> {
        self.shared.queue.lock().push_back(event);
        self.shared.waker.wake()
    }
}

/// The reactor: readiness polling, work queues, timers.
pub struct Loop<C> {
    poll: Poll,
    events: Events,
    queues: MultiQueue<C>,
    timers: BTreeMap<(Instant, u64), Event<C>>,
    timer_deadlines: HashMap<u64, Instant>,
    next_timer: u64,
    shared: Arc<Shared<C>>,
    next_token: usize,
    tick: Option<Duration>,
}

impl<C: 'static> Loop<C> {
    /// Create a loop with its own poll instance.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            queues: MultiQueue::new(),
            timers: BTreeMap::new(),
            timer_deadlines: HashMap::new(),
            next_timer: 0,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                waker,
            }),
            next_token: 0,
            tick: None,
        })
    }

    /// Registry for attaching handles to this loop.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Allocate a fresh token for a handle registration.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Thread-safe handle to this loop.
    pub fn handle(&self) -> LoopHandle<C> {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue an event on the main queue.
    pub fn schedule(&mut self, event: Event<C>) {
        self.queues.push(QueueId::MAIN, event);
    }

    /// Queue an event on a specific queue. Returns false if the queue is gone.
    pub fn put(&mut self, queue: QueueId, event: Event<C>) -> bool {
        self.queues.push(queue, event)
    }

    /// Create a child queue of [`QueueId::MAIN`].
    pub fn new_queue(&mut self) -> QueueId {
        self.queues.new_child(QueueId::MAIN)
    }

    /// Drop a child queue and its pending events.
    pub fn free_queue(&mut self, queue: QueueId) {
        self.queues.free(queue);
    }

    /// Whether `queue` has no runnable events.
    pub fn queue_is_empty(&mut self, queue: QueueId) -> bool {
        self.queues.is_empty(queue)
    }

    /// Number of runnable events reachable from `queue`.
    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.queues.len(queue)
    }

    /// Take one event from `queue` without running it.
    pub fn pop(&mut self, queue: QueueId) -> Option<Event<C>> {
        self.queues.pop(queue)
    }

    /// Run `event` once after `after` has elapsed.
    pub fn start_timer(&mut self, after: Duration, event: Event<C>) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        let deadline = Instant::now() + after;
        self.timers.insert((deadline, id), event);
        self.timer_deadlines.insert(id, deadline);
        TimerId(id)
    }

    /// Cancel a pending timer. Returns false if it already fired.
    pub fn cancel_timer(&mut self, timer: TimerId) -> bool {
        match self.timer_deadlines.remove(&timer.0) {
            Some(deadline) => self.timers.remove(&(deadline, timer.0)).is_some(),
            None => false,
        }
    }

    /// Number of timers still pending.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Bound every poll to `interval` (or lift the bound with `None`).
    ///
    /// Used while there are children to reap, whose exit is not a readiness event.
    pub fn set_tick(&mut self, interval: Option<Duration>) {
        self.tick = interval;
    }

    fn poll_timeout(&mut self, timeout: Timeout) -> Timeout {
        if !self.shared.queue.lock().is_empty() || !self.queues.is_empty(QueueId::FAST) {
            return Timeout::Immediate;
        }
        let mut timeout = timeout;
        if let Some(((deadline, _), _)) = self.timers.first_key_value() {
            timeout = timeout.cap(deadline.saturating_duration_since(Instant::now()));
        }
        if let Some(tick) = self.tick {
            timeout = timeout.cap(tick);
        }
        timeout
    }

    fn poll_once(&mut self, timeout: Timeout) -> Vec<Readiness> {
        let wait = self.poll_timeout(timeout);
        trace!(?wait, "polling");
        match self.poll.poll(&mut self.events, wait.as_option()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Vec::new(),
            Err(err) => {
                error!(error = %err, "event loop poll failed");
                return Vec::new();
            }
        }
        self.events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(Readiness::from_event)
            .collect()
    }

    fn pop_due_timer(&mut self, now: Instant) -> Option<Event<C>> {
        let (&(deadline, id), _) = self.timers.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.timer_deadlines.remove(&id);
        self.timers.remove(&(deadline, id))
    }

    fn absorb_thread_events(&mut self) {
        let pending: Vec<ThreadEvent<C>> = self.shared.queue.lock().drain(..).collect();
        for event in pending {
            let event: Event<C> = event;
            self.queues.push(QueueId::FAST, event);
        }
    }
}

/// Run one loop iteration.
///
/// Blocks for at most `timeout` waiting for readiness, dispatches readiness
/// to [`LoopContext::on_io`], fires due timers, then drains the fast queue
/// (including events from other threads). The main queue is left alone.
pub fn run_once<C: LoopContext>(ctx: &mut C, timeout: Timeout) {
    let ready = ctx.event_loop().poll_once(timeout);
    for readiness in ready {
        ctx.on_io(readiness);
    }
    ctx.on_tick();

    let now = Instant::now();
    while let Some(event) = ctx.event_loop().pop_due_timer(now) {
        event(ctx);
    }

    ctx.event_loop().absorb_thread_events();
    drain_queue(ctx, QueueId::FAST);
}

/// Run every event currently reachable from `queue`, including ones queued
/// by the events themselves.
pub fn drain_queue<C: LoopContext>(ctx: &mut C, queue: QueueId) {
    while let Some(event) = ctx.event_loop().pop(queue) {
        event(ctx);
    }
}

/// Pump the loop until `done` holds or `timeout` elapses.
///
/// Each round drains `queue` if it has events, otherwise runs one
/// [`run_once`] cycle. Returns the final value of `done`.
///
/// Anything may run while this waits, including handlers that re-enter the
/// caller's own code.
pub fn process_events_until<C, F>(ctx: &mut C, queue: QueueId, timeout: Timeout, mut done: F) -> bool
where
    C: LoopContext,
    F: FnMut(&mut C) -> bool,
{
    let deadline = match timeout {
        Timeout::After(d) => Some(Instant::now() + d),
        _ => None,
    };
    loop {
        if done(ctx) {
            return true;
        }
        if !ctx.event_loop().queue_is_empty(queue) {
            drain_queue(ctx, queue);
            continue;
        }
        let wait = match (timeout, deadline) {
            (Timeout::Immediate, _) => Timeout::Immediate,
            (_, Some(deadline)) => {
                let now = Instant::now();
                if now >= deadline {
                    return done(ctx);
                }
                Timeout::After(deadline - now)
            }
            _ => Timeout::Forever,
        };
        run_once(ctx, wait);
        if timeout == Timeout::Immediate {
            drain_queue(ctx, queue);
            return done(ctx);
        }
    }
}
