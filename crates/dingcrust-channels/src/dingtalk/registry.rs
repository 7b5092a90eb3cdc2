//! Per-conversation card slots.
//!
//! Each conversation key maps to a slot holding at most one open card. A slot
//! is locked for the whole of a delivery so the create/announce/stream/finish
//! sequence for one conversation never interleaves, while different
//! conversations proceed in parallel. `DashMap` guards are never held across
//! an `.await`; only the per-slot `tokio` mutex is.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::card::CardState;
use super::route::ConversationKey;

type Slot = Arc<Mutex<Option<CardState>>>;

#[derive(Default)]
pub struct CardRegistry {
    slots: DashMap<ConversationKey, Slot>,
}

impl CardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot for `key`, waiting for any delivery already in progress
    /// for the same conversation.
    pub async fn lock(&self, key: &ConversationKey) -> CardSlot<'_> {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let guard = slot.lock_owned().await;
        CardSlot {
            registry: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Clone of the open card for `key`.
    pub async fn get(&self, key: &ConversationKey) -> Option<CardState> {
        self.lock(key).await.card().cloned()
    }

    /// Register `card` for `key`, returning the card it superseded.
    pub async fn put(&self, key: &ConversationKey, card: CardState) -> Option<CardState> {
        self.lock(key).await.put(card)
    }

    /// Remove and return the open card for `key`. A second call returns `None`.
    pub async fn remove(&self, key: &ConversationKey) -> Option<CardState> {
        self.lock(key).await.take()
    }

    pub async fn contains(&self, key: &ConversationKey) -> bool {
        self.lock(key).await.card().is_some()
    }

    /// Snapshot of every open card.
    pub async fn entries(&self) -> Vec<(ConversationKey, CardState)> {
        let mut entries = Vec::new();
        for key in self.keys() {
            if let Some(card) = self.lock(&key).await.card() {
                entries.push((key, card.clone()));
            }
        }
        entries
    }

    /// Keys with a slot, open card or not.
    pub fn keys(&self) -> Vec<ConversationKey> {
        self.slots.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of slots currently allocated.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub async fn len(&self) -> usize {
        self.entries().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop the slot for `key` if it is empty and nobody else references it.
    ///
    /// `remove_if` runs under the shard lock, the same lock `lock()` needs to
    /// clone a slot, so a strong count of one cannot race with a new waiter.
    fn release_slot(&self, key: &ConversationKey) {
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|card| card.is_none())
        });
    }
}

/// Exclusive access to one conversation's card slot.
///
/// Dropping the guard unlocks the slot and frees it when it holds no card.
pub struct CardSlot<'a> {
    registry: &'a CardRegistry,
    key: ConversationKey,
    guard: Option<OwnedMutexGuard<Option<CardState>>>,
}

impl CardSlot<'_> {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    fn inner_mut(&mut self) -> Option<&mut Option<CardState>> {
        self.guard.as_deref_mut()
    }

    pub fn card(&self) -> Option<&CardState> {
        self.guard.as_deref().and_then(|slot| slot.as_ref())
    }

    pub fn card_mut(&mut self) -> Option<&mut CardState> {
        self.inner_mut().and_then(|slot| slot.as_mut())
    }

    /// Store `card`, superseding (and returning) any card already present.
    pub fn put(&mut self, card: CardState) -> Option<CardState> {
        self.inner_mut().and_then(|slot| slot.replace(card))
    }

    pub fn take(&mut self) -> Option<CardState> {
        self.inner_mut().and_then(|slot| slot.take())
    }
}

impl Drop for CardSlot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry.release_slot(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(name: &str) -> ConversationKey {
        ConversationKey::group(name)
    }

    #[tokio::test]
    async fn put_supersedes_existing_card() {
        let registry = CardRegistry::new();
        assert!(registry.put(&key("c"), CardState::new("card_1")).await.is_none());

        let old = registry.put(&key("c"), CardState::new("card_2")).await;
        assert_eq!(old.map(|c| c.id().to_string()).as_deref(), Some("card_1"));
        assert_eq!(registry.get(&key("c")).await.unwrap().id(), "card_2");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = CardRegistry::new();
        registry.put(&key("c"), CardState::new("card_1")).await;

        assert!(registry.remove(&key("c")).await.is_some());
        assert!(registry.remove(&key("c")).await.is_none());
        assert!(!registry.contains(&key("c")).await);
    }

    #[tokio::test]
    async fn empty_slots_are_released() {
        let registry = CardRegistry::new();
        assert!(registry.get(&key("a")).await.is_none());
        assert_eq!(registry.slot_count(), 0);

        registry.put(&key("a"), CardState::new("card_1")).await;
        assert_eq!(registry.slot_count(), 1);
        registry.remove(&key("a")).await;
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let registry = Arc::new(CardRegistry::new());
        let mut slot = registry.lock(&key("c")).await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let slot = registry.lock(&key("c")).await;
                slot.card().map(|c| c.content().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second locker must wait");

        let mut card = CardState::new("card_1");
        card.append("written under lock");
        slot.put(card);
        drop(slot);

        let seen = waiter.await.unwrap();
        assert_eq!(seen.as_deref(), Some("written under lock"));
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let registry = CardRegistry::new();
        let _a = registry.lock(&key("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), registry.lock(&key("b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn entries_lists_every_open_card() {
        let registry = CardRegistry::new();
        registry.put(&key("a"), CardState::new("card_a")).await;
        registry
            .put(&ConversationKey::direct("u"), CardState::new("card_u"))
            .await;

        let mut entries: Vec<_> = registry
            .entries()
            .await
            .into_iter()
            .map(|(k, c)| (k.to_string(), c.id().to_string()))
            .collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("direct:u".to_string(), "card_u".to_string()),
                ("group:a".to_string(), "card_a".to_string()),
            ]
        );

        registry.remove(&key("a")).await;
        registry.remove(&ConversationKey::direct("u")).await;
        assert!(registry.is_empty().await);
        assert_eq!(registry.slot_count(), 0);
    }
}
