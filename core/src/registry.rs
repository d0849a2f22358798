/// Device registry
///
/// Single source of truth for every peripheral seen by the bridge. Entries are
/// keyed by [`PeripheralId`], merged on each advertisement and bounded by an
/// LRU capacity. Peripherals with a live connection are pinned and can never
/// be evicted.

use crate::error::BridgeError;
use crate::types::{Advertisement, PeripheralId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Everything known about one peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    /// Signal strength of the latest advertisement (dBm)
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub advertisement_count: u64,
}

impl Peripheral {
    fn from_advertisement(adv: Advertisement, now: Instant) -> Self {
        Self {
            id: adv.id,
            name: adv.local_name,
            rssi: adv.rssi,
            service_uuids: adv.service_uuids,
            service_data: adv.service_data,
            manufacturer_data: adv.manufacturer_data,
            first_seen: now,
            last_seen: now,
            advertisement_count: 1,
        }
    }

    /// Fold a later advertisement into this record. Platforms often split
    /// name, services and manufacturer data over several reports, so fields
    /// missing from `adv` keep their previous value.
    fn merge(&mut self, adv: Advertisement, now: Instant) {
        if adv.local_name.is_some() {
            self.name = adv.local_name;
        }
        self.rssi = adv.rssi;
        for uuid in adv.service_uuids {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
        self.service_data.extend(adv.service_data);
        self.manufacturer_data.extend(adv.manufacturer_data);
        self.last_seen = now;
        self.advertisement_count += 1;
    }
}

/// Result of folding an advertisement into the registry
#[derive(Debug, Clone)]
pub struct Upsert {
    pub peripheral: Peripheral,
    pub is_new: bool,
    /// Entries pushed out to respect the capacity bound
    pub evicted: Vec<PeripheralId>,
}

pub struct DeviceRegistry {
    entries: HashMap<PeripheralId, Peripheral>,
    pinned: HashSet<PeripheralId>,
    capacity: usize,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            pinned: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Idempotent by identifier: creates the entry on first sight, merges
    /// advertisement data and refreshes last-seen afterwards.
    pub fn upsert(&mut self, adv: Advertisement, now: Instant) -> Upsert {
        let id = adv.id.clone();
        let is_new = match self.entries.get_mut(&id) {
            Some(existing) => {
                existing.merge(adv, now);
                false
            }
            None => {
                self.entries
                    .insert(id.clone(), Peripheral::from_advertisement(adv, now));
                debug!("Registered peripheral {}", id);
                true
            }
        };

        let evicted = if is_new { self.enforce_capacity(&id) } else { Vec::new() };

        let peripheral = self.entries[&id].clone();
        Upsert {
            peripheral,
            is_new,
            evicted,
        }
    }

    pub fn get(&self, id: &PeripheralId) -> Result<&Peripheral, BridgeError> {
        self.entries
            .get(id)
            .ok_or_else(|| BridgeError::NotFound(format!("peripheral {}", id)))
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.entries.contains_key(id)
    }

    /// Protect an entry from eviction while its connection is live
    pub fn pin(&mut self, id: &PeripheralId) {
        self.pinned.insert(id.clone());
    }

    pub fn unpin(&mut self, id: &PeripheralId) {
        self.pinned.remove(id);
    }

    /// Remove an entry that is not currently connected
    pub fn evict(&mut self, id: &PeripheralId) -> Result<Peripheral, BridgeError> {
        if !self.entries.contains_key(id) {
            return Err(BridgeError::NotFound(format!("peripheral {}", id)));
        }
        if self.pinned.contains(id) {
            return Err(BridgeError::InvalidState {
                operation: "evict",
                detail: format!("{} has a live connection", id),
            });
        }
        self.entries
            .remove(id)
            .ok_or_else(|| BridgeError::NotFound(format!("peripheral {}", id)))
    }

    /// Remove every unpinned entry not seen for `max_age`
    pub fn evict_stale(&mut self, max_age: Duration, now: Instant) -> Vec<PeripheralId> {
        let mut stale: Vec<PeripheralId> = self
            .entries
            .values()
            .filter(|p| !self.pinned.contains(&p.id))
            .filter(|p| now.saturating_duration_since(p.last_seen) >= max_age)
            .map(|p| p.id.clone())
            .collect();
        stale.sort();
        for id in &stale {
            self.entries.remove(id);
        }
        if !stale.is_empty() {
            debug!("Evicted {} stale peripherals", stale.len());
        }
        stale
    }

    /// Snapshot of all entries, ordered by identifier
    pub fn peripherals(&self) -> Vec<Peripheral> {
        let mut all: Vec<Peripheral> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_capacity(&mut self, keep: &PeripheralId) -> Vec<PeripheralId> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .values()
                .filter(|p| &p.id != keep && !self.pinned.contains(&p.id))
                .min_by_key(|p| p.last_seen)
                .map(|p| p.id.clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                    evicted.push(id);
                }
                // Everything else is pinned; allow the overshoot
                None => break,
            }
        }
        evicted
    }
}
