//! Channel registries and session links
//!
//! One registry per pipe kind, keyed by channel number. Channel objects are
//! created lazily and keep their identity until the engine closes; a link
//! records which session currently owns a channel.

use super::channel_type::{ChannelType, PipeKind};
use crate::error::{Result, TunnelError};
use crate::protocol::CHANNEL_SPACE;
use crate::tunnel::TunnelSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, ignoring poisoning
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of a linked channel
#[derive(Clone)]
pub enum SessionLink {
    /// Reserved control channel
    Control,
    /// Session this side requested
    Outgoing(Arc<TunnelSession>),
    /// Session the peer requested
    Incoming(Arc<TunnelSession>),
}

impl SessionLink {
    pub fn session(&self) -> Option<&Arc<TunnelSession>> {
        match self {
            SessionLink::Control => None,
            SessionLink::Outgoing(session) | SessionLink::Incoming(session) => Some(session),
        }
    }
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionLink::Control => f.write_str("Control"),
            SessionLink::Outgoing(_) => f.write_str("Outgoing"),
            SessionLink::Incoming(_) => f.write_str("Incoming"),
        }
    }
}

pub(crate) trait RegisteredChannel {
    fn link(&self) -> Option<SessionLink>;
    fn set_link(&self, link: Option<SessionLink>);
    fn retype(&self, channel_type: ChannelType);
}

pub(crate) struct ChannelRegistry<C> {
    buffered: HashMap<u32, Arc<C>>,
    direct: HashMap<u32, Arc<C>>,
}

impl<C: RegisteredChannel> ChannelRegistry<C> {
    pub fn new() -> Self {
        ChannelRegistry {
            buffered: HashMap::new(),
            direct: HashMap::new(),
        }
    }

    fn map(&mut self, kind: PipeKind) -> &mut HashMap<u32, Arc<C>> {
        match kind {
            PipeKind::Buffered => &mut self.buffered,
            PipeKind::Direct => &mut self.direct,
        }
    }

    /// Resolve `(type, number)`, creating the channel on first use
    ///
    /// The stored type is refreshed to `channel_type` on every lookup.
    pub fn get_or_create(
        &mut self,
        channel_type: ChannelType,
        number: u32,
        make: impl FnOnce() -> C,
    ) -> Arc<C> {
        let channel = self
            .map(channel_type.pipe_kind())
            .entry(number)
            .or_insert_with(|| Arc::new(make()))
            .clone();
        channel.retype(channel_type);
        channel
    }

    /// Lowest-numbered channel that is absent or unlinked, linked to `link`
    pub fn link_first_free(
        &mut self,
        channel_type: ChannelType,
        link: SessionLink,
        mut make: impl FnMut(u32) -> C,
    ) -> Result<Arc<C>> {
        let map = self.map(channel_type.pipe_kind());
        let number = (0..CHANNEL_SPACE)
            .find(|n| map.get(n).map_or(true, |c| c.link().is_none()))
            .ok_or(TunnelError::ResourceExhausted)?;
        let channel = map
            .entry(number)
            .or_insert_with(|| Arc::new(make(number)))
            .clone();
        channel.retype(channel_type);
        channel.set_link(Some(link));
        Ok(channel)
    }

    /// Link channel `number` unless a session already holds it
    pub fn link_number_if_free(
        &mut self,
        channel_type: ChannelType,
        number: u32,
        link: SessionLink,
        make: impl FnOnce() -> C,
    ) -> Result<Arc<C>> {
        let channel = self
            .map(channel_type.pipe_kind())
            .entry(number)
            .or_insert_with(|| Arc::new(make()))
            .clone();
        if channel.link().is_some() {
            return Err(TunnelError::ResourceExhausted);
        }
        channel.retype(channel_type);
        channel.set_link(Some(link));
        Ok(channel)
    }

    /// Existing channel, without creating one
    pub fn get(&self, kind: PipeKind, number: u32) -> Option<Arc<C>> {
        match kind {
            PipeKind::Buffered => self.buffered.get(&number),
            PipeKind::Direct => self.direct.get(&number),
        }
        .cloned()
    }

    /// Remove and return every channel
    pub fn drain(&mut self) -> Vec<Arc<C>> {
        self.buffered
            .drain()
            .chain(self.direct.drain())
            .map(|(_, channel)| channel)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffered.len() + self.direct.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct Probe {
        number: u32,
        ty: AtomicU8,
        link: Mutex<Option<SessionLink>>,
    }

    impl Probe {
        fn new(number: u32) -> Self {
            Probe {
                number,
                ty: AtomicU8::new(0),
                link: Mutex::new(None),
            }
        }
    }

    impl RegisteredChannel for Probe {
        fn link(&self) -> Option<SessionLink> {
            lock(&self.link).clone()
        }
        fn set_link(&self, link: Option<SessionLink>) {
            *lock(&self.link) = link;
        }
        fn retype(&self, channel_type: ChannelType) {
            self.ty.store(channel_type.bits(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_lookup_keeps_identity_and_refreshes_type() {
        let mut registry = ChannelRegistry::new();
        let a = registry.get_or_create(ChannelType::DIRECT, 3, || Probe::new(3));
        let b = registry.get_or_create(ChannelType::from_bits(0x03), 3, || Probe::new(99));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.number, 3);
        assert_eq!(b.ty.load(Ordering::SeqCst), 0x03);

        // buffered and direct are separate key spaces
        let c = registry.get_or_create(ChannelType::BUFFERED, 3, || Probe::new(3));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_first_free_skips_linked() {
        let mut registry = ChannelRegistry::new();
        let first = registry
            .link_first_free(ChannelType::DIRECT, SessionLink::Control, Probe::new)
            .unwrap();
        let second = registry
            .link_first_free(ChannelType::DIRECT, SessionLink::Control, Probe::new)
            .unwrap();
        assert_eq!((first.number, second.number), (0, 1));

        // unlinked existing channels are reused, lowest first
        first.set_link(None);
        let again = registry
            .link_first_free(ChannelType::DIRECT, SessionLink::Control, Probe::new)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let third = registry
            .link_first_free(ChannelType::DIRECT, SessionLink::Control, Probe::new)
            .unwrap();
        assert_eq!(third.number, 2);
    }

    #[test]
    fn test_link_number_refuses_linked_channel() {
        let mut registry = ChannelRegistry::new();
        let claimed = registry
            .link_number_if_free(ChannelType::DIRECT, 7, SessionLink::Control, || Probe::new(7))
            .unwrap();
        assert!(matches!(
            registry.link_number_if_free(ChannelType::DIRECT, 7, SessionLink::Control, || Probe::new(7)),
            Err(TunnelError::ResourceExhausted)
        ));

        claimed.set_link(None);
        assert!(registry
            .link_number_if_free(ChannelType::DIRECT, 7, SessionLink::Control, || Probe::new(7))
            .is_ok());
        assert!(registry.get(PipeKind::Direct, 7).is_some());
        assert!(registry.get(PipeKind::Buffered, 7).is_none());
    }

    #[test]
    fn test_drain_empties_both_maps() {
        let mut registry = ChannelRegistry::new();
        registry.get_or_create(ChannelType::DIRECT, 1, || Probe::new(1));
        registry.get_or_create(ChannelType::BUFFERED, 1, || Probe::new(1));
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
