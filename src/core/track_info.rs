//! Now-playing state store
//! Holds the latest value received for every attribute and publishes the whole
//! snapshot to subscribers each time an update lands.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::watch;

use crate::core::codec::{
    Attribute, AttributeCategory, AttributeUpdate, DecodeError, PlayerAttribute, QueueAttribute,
    TrackAttribute,
};

/// Last-known value per (category, sub-attribute). Absent means never received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSnapshot {
    values: BTreeMap<Attribute, String>,
}

impl TrackSnapshot {
    pub fn get(&self, attribute: Attribute) -> Option<&str> {
        self.values.get(&attribute).map(String::as_str)
    }

    /// Looks a value up by raw wire ids.
    pub fn value(&self, category: AttributeCategory, id: u8) -> Result<Option<&str>, DecodeError> {
        Ok(self.get(Attribute::from_ids(category, id)?))
    }

    pub fn track(&self, attribute: TrackAttribute) -> Option<&str> {
        self.get(Attribute::Track(attribute))
    }

    pub fn queue(&self, attribute: QueueAttribute) -> Option<&str> {
        self.get(Attribute::Queue(attribute))
    }

    pub fn player(&self, attribute: PlayerAttribute) -> Option<&str> {
        self.get(Attribute::Player(attribute))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &str)> {
        self.values.iter().map(|(attr, value)| (*attr, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, update: &AttributeUpdate) {
        self.values
            .insert(update.attribute(), update.value().to_owned());
    }
}

impl fmt::Display for TrackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |value: Option<&str>| value.unwrap_or("-").to_owned();
        write!(
            f,
            "{} - {} [{}] ({}) | queue {}/{} | {} vol {}",
            field(self.track(TrackAttribute::Artist)),
            field(self.track(TrackAttribute::Title)),
            field(self.track(TrackAttribute::Album)),
            field(self.track(TrackAttribute::Duration)),
            field(self.queue(QueueAttribute::Index)),
            field(self.queue(QueueAttribute::Count)),
            field(self.player(PlayerAttribute::Name)),
            field(self.player(PlayerAttribute::Volume)),
        )
    }
}

/// Applies decoded updates in arrival order and fans the full snapshot out.
#[derive(Debug)]
pub struct TrackStore {
    tx: watch::Sender<TrackSnapshot>,
}

impl TrackStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TrackSnapshot::default());
        Self { tx }
    }

    /// Overwrites the stored value for the update's key and notifies subscribers.
    pub fn apply(&self, update: &AttributeUpdate) {
        self.tx.send_modify(|snapshot| snapshot.insert(update));
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver that observes the whole snapshot after every applied update.
    pub fn subscribe(&self) -> watch::Receiver<TrackSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for TrackStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(attribute: Attribute, value: &str) -> AttributeUpdate {
        AttributeUpdate::new(attribute, value)
    }

    #[test]
    fn last_write_wins_per_key() {
        let store = TrackStore::new();
        store.apply(&update(Attribute::Track(TrackAttribute::Artist), "A"));
        store.apply(&update(Attribute::Player(PlayerAttribute::Volume), "5"));
        store.apply(&update(Attribute::Track(TrackAttribute::Artist), "B"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.track(TrackAttribute::Artist), Some("B"));
        assert_eq!(snapshot.player(PlayerAttribute::Volume), Some("5"));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn absent_entries_were_never_received() {
        let store = TrackStore::new();
        let snapshot = store.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.track(TrackAttribute::Title), None);
        assert_eq!(snapshot.value(AttributeCategory::Queue, 0x01), Ok(None));
        assert!(snapshot.value(AttributeCategory::Queue, 0x09).is_err());
    }

    #[tokio::test]
    async fn subscribers_see_full_snapshot() {
        let store = TrackStore::new();
        let mut rx = store.subscribe();

        store.apply(&update(Attribute::Track(TrackAttribute::Title), "Hi"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().track(TrackAttribute::Title), Some("Hi"));

        store.apply(&update(Attribute::Queue(QueueAttribute::Count), "12"));
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.track(TrackAttribute::Title), Some("Hi"));
        assert_eq!(snapshot.queue(QueueAttribute::Count), Some("12"));
    }

    #[test]
    fn display_fills_missing_fields() {
        let store = TrackStore::new();
        store.apply(&update(Attribute::Track(TrackAttribute::Title), "Hi"));
        let text = store.snapshot().to_string();
        assert!(text.starts_with("- - Hi"));
    }
}
