// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Registration sets shared by the client and its workers.
//!
//! Locks here guard plain map/vector updates only and are never held across
//! an `.await`.

use crate::{consumer::ConsumerInner, declaration::Declaration, publisher::PublisherInner};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a consumer or publisher registration.
pub(crate) fn next_registration_id() -> u64 {
    NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
pub(crate) struct Registry {
    declarations: Mutex<Vec<Arc<dyn Declaration>>>,
    consumers: Mutex<HashMap<u64, Arc<ConsumerInner>>>,
    publishers: Mutex<HashMap<u64, Arc<PublisherInner>>>,
}

impl Registry {
    pub(crate) fn add_declarations<I>(&self, declarations: I)
    where
        I: IntoIterator<Item = Arc<dyn Declaration>>,
    {
        self.declarations.lock().extend(declarations);
    }

    pub(crate) fn declarations(&self) -> Vec<Arc<dyn Declaration>> {
        self.declarations.lock().clone()
    }

    pub(crate) fn add_consumer(&self, consumer: Arc<ConsumerInner>) {
        self.consumers.lock().insert(consumer.id, consumer);
    }

    pub(crate) fn remove_consumer(&self, id: u64) -> bool {
        self.consumers.lock().remove(&id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn has_consumer(&self, id: u64) -> bool {
        self.consumers.lock().contains_key(&id)
    }

    pub(crate) fn consumers(&self) -> Vec<Arc<ConsumerInner>> {
        self.consumers.lock().values().cloned().collect()
    }

    pub(crate) fn add_publisher(&self, publisher: Arc<PublisherInner>) {
        self.publishers.lock().insert(publisher.id, publisher);
    }

    pub(crate) fn remove_publisher(&self, id: u64) -> bool {
        self.publishers.lock().remove(&id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn has_publisher(&self, id: u64) -> bool {
        self.publishers.lock().contains_key(&id)
    }

    pub(crate) fn publishers(&self) -> Vec<Arc<PublisherInner>> {
        self.publishers.lock().values().cloned().collect()
    }
}
