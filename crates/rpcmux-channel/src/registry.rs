use std::collections::BTreeMap;

use crate::channel::{Channel, ChannelId, FIRST_DYNAMIC_ID, STDERR_ID, STDIO_ID};

/// Table of live channels, owned by one [`crate::Runtime`].
///
/// Lookups borrow; ownership stays with the registry until the channel's
/// refcount drops to zero and the deferred free removes it.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelId, Channel>,
    next_id: ChannelId,
    did_stdio: bool,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: BTreeMap::new(),
            next_id: FIRST_DYNAMIC_ID,
            did_stdio: false,
        }
    }

    /// Hand out the next dynamic id.
    pub(crate) fn reserve_id(&mut self) -> ChannelId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Give back an id that was never registered. Only the most recent
    /// reservation can be returned.
    pub(crate) fn release_id(&mut self, id: ChannelId) -> bool {
        if id + 1 == self.next_id && !self.channels.contains_key(&id) {
            self.next_id = id;
            return true;
        }
        false
    }

    /// Claim the stdio id. Fails if it was claimed before.
    pub(crate) fn claim_stdio(&mut self) -> Option<ChannelId> {
        if self.did_stdio {
            return None;
        }
        self.did_stdio = true;
        Some(STDIO_ID)
    }

    pub(crate) fn insert(&mut self, channel: Channel) {
        self.channels.insert(channel.id, channel);
    }

    pub(crate) fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Whether `id` was ever handed out (so it may have existed).
    pub fn was_allocated(&self, id: ChannelId) -> bool {
        (FIRST_DYNAMIC_ID..self.next_id).contains(&id)
            || (id == STDIO_ID && self.did_stdio)
            || id == STDERR_ID
    }

    /// Next id that will be handed out.
    pub fn next_id(&self) -> ChannelId {
        self.next_id
    }

    /// Ids of all live channels, ascending.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.values_mut()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rpcmux_event::QueueId;

    use super::*;
    use crate::channel::Transport;

    fn internal(id: ChannelId) -> Channel {
        Channel::new(id, Transport::Internal { closed: false }, QueueId::MAIN)
    }

    #[test]
    fn ids_are_monotonic_from_three() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(registry.reserve_id(), 3);
        assert_eq!(registry.reserve_id(), 4);
        assert!(registry.was_allocated(4));
        assert!(!registry.was_allocated(5));
    }

    #[test]
    fn released_id_is_reused() {
        let mut registry = ChannelRegistry::new();
        let id = registry.reserve_id();
        assert!(registry.release_id(id));
        assert_eq!(registry.reserve_id(), id);

        let older = id;
        let newer = registry.reserve_id();
        assert!(!registry.release_id(older));
        assert!(registry.release_id(newer));
    }

    #[test]
    fn stdio_is_claimed_once() {
        let mut registry = ChannelRegistry::new();
        assert!(!registry.was_allocated(STDIO_ID));
        assert!(!registry.was_allocated(0));
        assert!(registry.was_allocated(STDERR_ID));
        assert_eq!(registry.claim_stdio(), Some(STDIO_ID));
        assert_eq!(registry.claim_stdio(), None);
        assert!(registry.was_allocated(STDIO_ID));
    }

    #[test]
    fn lookup_and_enumeration() {
        let mut registry = ChannelRegistry::new();
        let a = registry.reserve_id();
        let b = registry.reserve_id();
        registry.insert(internal(b));
        registry.insert(internal(a));

        assert_eq!(registry.ids(), vec![a, b]);
        assert_eq!(registry.get(a).map(Channel::id), Some(a));
        assert!(registry.remove(a).is_some());
        assert!(!registry.contains(a));
        assert_eq!(registry.len(), 1);
    }
}
