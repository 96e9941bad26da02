// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The ssrc -> channel map: read-mostly lookups under a read lock,
//! creation and teardown under the write lock. Creation is serialized
//! under the write lock, so a command racing a dynamic create either
//! finds no channel (and creates) or the finished one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::channel::{Channel, SSRC_BROADCAST, SSRC_TEMPLATE};

#[derive(Debug)]
pub enum RegistryError {
    ReservedSsrc(u32),
    AlreadyExists(u32),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReservedSsrc(ssrc) => write!(f, "ssrc {:#010x} is reserved", ssrc),
            Self::AlreadyExists(ssrc) => write!(f, "ssrc {} already registered", ssrc),
        }
    }
}

impl std::error::Error for RegistryError {}

pub struct Registry {
    inner: RwLock<HashMap<u32, Arc<Channel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, ssrc: u32) -> Option<Arc<Channel>> {
        match self.inner.read() {
            Ok(map) => map.get(&ssrc).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&ssrc).cloned(),
        }
    }

    pub fn insert(&self, channel: Arc<Channel>) -> Result<(), RegistryError> {
        let ssrc = channel.ssrc;
        if ssrc == SSRC_TEMPLATE || ssrc == SSRC_BROADCAST {
            return Err(RegistryError::ReservedSsrc(ssrc));
        }
        let mut map = match self.inner.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if map.contains_key(&ssrc) {
            return Err(RegistryError::AlreadyExists(ssrc));
        }
        map.insert(ssrc, channel);
        Ok(())
    }

    /// Release an ssrc at teardown.
    pub fn remove(&self, ssrc: u32) -> Option<Arc<Channel>> {
        let mut map = match self.inner.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(&ssrc)
    }

    /// Snapshot of all channels, in ssrc order (the broadcast stagger
    /// depends on a stable iteration order).
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let map = match self.inner.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut list: Vec<Arc<Channel>> = map.values().cloned().collect();
        list.sort_by_key(|chan| chan.ssrc);
        list
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::frontend::Frontend;
    use mrx_core::fft::InputDomain;

    fn channel(ssrc: u32) -> Arc<Channel> {
        let frontend = Arc::new(Frontend::new(
            "test".into(),
            96_000,
            InputDomain::Complex,
            16,
            0.0,
            0.0,
        ));
        let state = ChannelState::template(&frontend, 50.0);
        Arc::new(Channel::new(ssrc, frontend, state))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let registry = Registry::new();
        registry.insert(channel(17)).unwrap();
        assert!(registry.lookup(17).is_some());
        assert!(registry.lookup(18).is_none());
        registry.remove(17);
        assert!(registry.lookup(17).is_none());
    }

    #[test]
    fn test_reserved_ssrcs_are_refused() {
        let registry = Registry::new();
        assert!(matches!(
            registry.insert(channel(SSRC_TEMPLATE)),
            Err(RegistryError::ReservedSsrc(_))
        ));
        assert!(matches!(
            registry.insert(channel(SSRC_BROADCAST)),
            Err(RegistryError::ReservedSsrc(_))
        ));
    }

    #[test]
    fn test_duplicate_insert_is_refused() {
        let registry = Registry::new();
        registry.insert(channel(5)).unwrap();
        assert!(matches!(
            registry.insert(channel(5)),
            Err(RegistryError::AlreadyExists(5))
        ));
    }

    #[test]
    fn test_channels_sorted_by_ssrc() {
        let registry = Registry::new();
        for ssrc in [30u32, 10, 20] {
            registry.insert(channel(ssrc)).unwrap();
        }
        let order: Vec<u32> = registry.channels().iter().map(|c| c.ssrc).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }
}
