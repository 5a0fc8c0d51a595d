use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use lanpush_core::device::MacAddress;

use crate::events::{EngineEvent, EventBus};

/// Tracks which devices have announced themselves recently.
///
/// Written from the presence receive loop and the timeout sweep; every
/// mutation takes the write lock, lookups share the read lock.
#[derive(Debug)]
pub struct OnlineRegistry {
    last_seen: RwLock<HashMap<MacAddress, DateTime<Utc>>>,
    timeout: TimeDelta,
    events: EventBus,
}

impl OnlineRegistry {
    /// `timeout` is the silence after which a device is evicted, normally
    /// `presenceSendPeriod + maxPingMs`.
    #[must_use]
    pub fn new(timeout: Duration, events: EventBus) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
            events,
        }
    }

    pub fn is_online(&self, mac: MacAddress) -> bool {
        self.last_seen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&mac)
    }

    /// MACs currently considered online, in no particular order.
    pub fn online_devices(&self) -> Vec<MacAddress> {
        self.last_seen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn mark_online(&self, mac: MacAddress) {
        self.mark_online_at(mac, Utc::now());
    }

    /// Inserts or refreshes the liveness entry. Publishes
    /// [`EngineEvent::DeviceOnline`] only when the device was offline.
    pub fn mark_online_at(&self, mac: MacAddress, now: DateTime<Utc>) {
        let was_online = self
            .last_seen
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mac, now)
            .is_some();

        if !was_online {
            debug!(mac = %mac, "Device came online");
            self.events.publish(EngineEvent::DeviceOnline { mac });
        }
    }

    /// Backdates the entry past the timeout so the next sweep evicts it.
    /// Unknown MACs are ignored.
    pub fn mark_offline(&self, mac: MacAddress) {
        let mut last_seen = self.last_seen.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(seen) = last_seen.get_mut(&mac) {
            *seen = DateTime::<Utc>::MIN_UTC;
        }
    }

    pub fn sweep_expired(&self) -> Vec<MacAddress> {
        self.sweep_expired_at(Utc::now())
    }

    /// Evicts every entry silent for longer than the timeout and publishes
    /// [`EngineEvent::DeviceOffline`] for each. Returns the evicted MACs.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<MacAddress> {
        let mut evicted = Vec::new();
        {
            let mut last_seen = self.last_seen.write().unwrap_or_else(PoisonError::into_inner);
            last_seen.retain(|mac, seen| {
                let keep = now.signed_duration_since(*seen) <= self.timeout;
                if !keep {
                    evicted.push(*mac);
                }
                keep
            });
        }

        for mac in &evicted {
            debug!(mac = %mac, "Device timed out");
            self.events.publish(EngineEvent::DeviceOffline { mac: *mac });
        }
        evicted
    }
}
