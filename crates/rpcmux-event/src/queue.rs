//! Parent/child work queues.
//!
//! An event put on a child queue is also visible from its parent, in the
//! order it was pushed relative to everything else on the parent. Popping
//! from the child directly leaves a stale link behind in the parent, which
//! the parent skips when it reaches it.

use std::collections::{HashMap, VecDeque};

/// A queued callback run on the loop thread with the loop context.
pub type Event<C> = Box<dyn FnOnce(&mut C)>;

/// Identifier of one queue inside a [`MultiQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u32);

impl QueueId {
    /// Primary application queue. Drained explicitly by the owner of the loop.
    pub const MAIN: QueueId = QueueId(0);
    /// Drained at the end of every loop iteration.
    pub const FAST: QueueId = QueueId(1);

    /// Raw numeric value (diagnostics only).
    pub fn get(self) -> u32 {
        self.0
    }
}

enum Entry<C> {
    Event(Event<C>),
    Link { child: QueueId, seq: u64 },
}

struct Queue<C> {
    parent: Option<QueueId>,
    entries: VecDeque<(u64, Entry<C>)>,
    next_seq: u64,
}

impl<C> Queue<C> {
    fn new(parent: Option<QueueId>) -> Self {
        Self {
            parent,
            entries: VecDeque::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, entry: Entry<C>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back((seq, entry));
        seq
    }
}

/// A set of FIFO queues where child queues feed their parent.
///
/// Nesting is one level deep: a child cannot itself have children.
pub struct MultiQueue<C> {
    queues: HashMap<QueueId, Queue<C>>,
    next_id: u32,
}

impl<C> MultiQueue<C> {
    /// Create the two root queues, [`QueueId::MAIN`] and [`QueueId::FAST`].
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        queues.insert(QueueId::MAIN, Queue::new(None));
        queues.insert(QueueId::FAST, Queue::new(None));
        Self { queues, next_id: 2 }
    }

    /// Create a child of `parent`. A child parent is rejected by attaching
    /// the new queue to the grandparent instead.
    pub fn new_child(&mut self, parent: QueueId) -> QueueId {
        let parent = match self.queues.get(&parent) {
            Some(queue) => Some(queue.parent.unwrap_or(parent)),
            None => None,
        };
        let id = QueueId(self.next_id);
        self.next_id += 1;
        self.queues.insert(id, Queue::new(parent));
        id
    }

    /// Remove a child queue, dropping its pending events. Root queues stay.
    pub fn free(&mut self, id: QueueId) {
        if id != QueueId::MAIN && id != QueueId::FAST {
            self.queues.remove(&id);
        }
    }

    /// Whether the queue exists.
    pub fn contains(&self, id: QueueId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Append an event. Returns false (dropping it) when the queue is gone.
    pub fn push(&mut self, id: QueueId, event: Event<C>) -> bool {
        let Some(queue) = self.queues.get_mut(&id) else {
            return false;
        };
        let seq = queue.push(Entry::Event(event));
        if let Some(parent) = queue.parent {
            if let Some(parent) = self.queues.get_mut(&parent) {
                parent.push(Entry::Link { child: id, seq });
            }
        }
        true
    }

    /// Take the next event from `id`, following links into children.
    pub fn pop(&mut self, id: QueueId) -> Option<Event<C>> {
        loop {
            let (_, entry) = self.queues.get_mut(&id)?.entries.pop_front()?;
            match entry {
                Entry::Event(event) => return Some(event),
                Entry::Link { child, seq } => {
                    if let Some(event) = self.take_linked(child, seq) {
                        return Some(event);
                    }
                }
            }
        }
    }

    fn take_linked(&mut self, child: QueueId, seq: u64) -> Option<Event<C>> {
        let queue = self.queues.get_mut(&child)?;
        match queue.entries.front() {
            Some((front, Entry::Event(_))) if *front == seq => {}
            _ => return None,
        }
        match queue.entries.pop_front() {
            Some((_, Entry::Event(event))) => Some(event),
            _ => None,
        }
    }

    fn link_is_live(&self, child: QueueId, seq: u64) -> bool {
        self.queues
            .get(&child)
            .and_then(|queue| queue.entries.front())
            .is_some_and(|(front, _)| *front == seq)
    }

    /// Whether `id` has no runnable event. Stale links are discarded.
    pub fn is_empty(&mut self, id: QueueId) -> bool {
        loop {
            let stale = match self.queues.get(&id).and_then(|q| q.entries.front()) {
                None => return true,
                Some((_, Entry::Event(_))) => return false,
                Some((_, Entry::Link { child, seq })) => !self.link_is_live(*child, *seq),
            };
            if !stale {
                return false;
            }
            if let Some(queue) = self.queues.get_mut(&id) {
                queue.entries.pop_front();
            }
        }
    }

    /// Number of runnable events reachable from `id`.
    pub fn len(&self, id: QueueId) -> usize {
        let Some(queue) = self.queues.get(&id) else {
            return 0;
        };
        match queue.parent {
            Some(_) => queue.entries.len(),
            None => {
                // A link is counted when its child still holds that sequence number.
                queue
                    .entries
                    .iter()
                    .filter(|(_, entry)| match entry {
                        Entry::Event(_) => true,
                        Entry::Link { child, seq } => self.queues.get(child).is_some_and(|c| {
                            c.entries.iter().any(|(s, _)| s == seq)
                        }),
                    })
                    .count()
            }
        }
    }
}

impl<C> Default for MultiQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
