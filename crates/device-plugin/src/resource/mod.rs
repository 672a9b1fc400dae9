//! Resource managers. Each manager owns the device set for one advertised
//! resource: it resolves replica ids to backing devices, validates and
//! shapes allocations, and runs the health loop that turns critical device
//! events into per-device health transitions.

pub mod builder;
pub mod device;
#[cfg(test)]
pub(crate) mod test_utils;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::{Config, HealthChecks, DEFAULT_IGNORED_XIDS};
use crate::provider::{CriticalEvent, DeviceKind, DeviceProvider};

pub use builder::build_resource_managers;
pub use device::{Device, DeviceId, Health, ResourceName};

/// An allocation request the manager refuses. Returned to the kubelet as a
/// descriptive RPC error; never crashes the server.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("request too large: {count} devices requested, but a shared resource may only be requested one device at a time")]
    RequestTooLarge { count: usize },

    #[error("allocation size {size} is smaller than the {must_include} devices that must be included")]
    AllocationSizeTooSmall { size: usize, must_include: usize },

    #[error("requested {size} devices, but only {available} are available")]
    NotEnoughDevices { size: usize, available: usize },
}

pub struct ResourceManager {
    resource: ResourceName,
    devices: RwLock<BTreeMap<DeviceId, Device>>,
    /// True when this resource is replicated and oversize requests must be
    /// refused.
    fail_requests_greater_than_one: bool,
    config: Arc<Config>,
    provider: Arc<dyn DeviceProvider>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resource", &self.resource)
            .field("devices", &self.devices)
            .field(
                "fail_requests_greater_than_one",
                &self.fail_requests_greater_than_one,
            )
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    pub fn new(
        resource: ResourceName,
        devices: Vec<Device>,
        fail_requests_greater_than_one: bool,
        config: Arc<Config>,
        provider: Arc<dyn DeviceProvider>,
    ) -> Self {
        let devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        ResourceManager {
            resource,
            devices: RwLock::new(devices),
            fail_requests_greater_than_one,
            config,
            provider,
        }
    }

    /// The advertised resource name. Immutable for the manager's lifetime.
    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    /// Snapshot of the device set with current health, in canonical order.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.read().unwrap().is_empty()
    }

    /// Validates a kubelet allocation request. Every id must name a known
    /// device; duplicates are collapsed rather than rejected. Returns the
    /// deduplicated ids in canonical order.
    pub fn validate_request(&self, ids: &[String]) -> Result<Vec<DeviceId>, RequestError> {
        let devices = self.devices.read().unwrap();
        let mut requested = BTreeSet::new();
        for raw in ids {
            let id = DeviceId::parse(raw);
            if !devices.contains_key(&id) {
                return Err(RequestError::UnknownDevice(raw.clone()));
            }
            requested.insert(id);
        }
        let contains_replicas = requested.iter().any(|id| id.replica_index().is_some());
        if self.fail_requests_greater_than_one && contains_replicas && requested.len() > 1 {
            return Err(RequestError::RequestTooLarge {
                count: requested.len(),
            });
        }
        Ok(requested.into_iter().collect())
    }

    /// Union of host device-node paths for the backing devices of the
    /// given ids. Deterministically ordered, duplicates removed.
    pub fn device_paths(&self, ids: &[DeviceId]) -> Vec<PathBuf> {
        let devices = self.devices.read().unwrap();
        let parents: BTreeSet<&str> = ids.iter().map(|id| id.parent()).collect();
        let paths: BTreeSet<PathBuf> = devices
            .values()
            .filter(|d| parents.contains(d.id.parent()))
            .flat_map(|d| d.paths.iter().cloned())
            .collect();
        paths.into_iter().collect()
    }

    /// One device per distinct backing device among `ids`, in canonical
    /// order. Replica ids collapse onto their backing device.
    pub(crate) fn backing_devices(&self, ids: &[DeviceId]) -> Vec<Device> {
        let devices = self.devices.read().unwrap();
        let parents: BTreeSet<&str> = ids.iter().map(|id| id.parent()).collect();
        let mut seen = BTreeSet::new();
        devices
            .values()
            .filter(|d| parents.contains(d.id.parent()))
            .filter(|d| seen.insert(d.id.parent().to_string()))
            .cloned()
            .collect()
    }

    /// Computes a preferred set of `size` devices drawn from `available`,
    /// always including `must_include`. Prefers NUMA-local groupings when
    /// topology hints exist, spreads load across the backing devices of
    /// replicas while keeping the leftover replicas contiguous, and is
    /// deterministic for a given input. With no affinity data the result is
    /// the first `size` devices in canonical order.
    pub fn get_preferred_allocation(
        &self,
        available: &[String],
        must_include: &[String],
        size: usize,
    ) -> Result<Vec<String>, RequestError> {
        let devices = self.devices.read().unwrap();

        let mut chosen: Vec<DeviceId> = Vec::new();
        for raw in must_include {
            let id = DeviceId::parse(raw);
            if !devices.contains_key(&id) {
                return Err(RequestError::UnknownDevice(raw.clone()));
            }
            if !chosen.contains(&id) {
                chosen.push(id);
            }
        }
        if chosen.len() > size {
            return Err(RequestError::AllocationSizeTooSmall {
                size,
                must_include: chosen.len(),
            });
        }

        // Ids the kubelet considers available but we no longer know are
        // skipped rather than failing the whole computation
        let mut candidates: Vec<DeviceId> = available
            .iter()
            .map(|raw| DeviceId::parse(raw))
            .filter(|id| devices.contains_key(id) && !chosen.contains(id))
            .collect();
        candidates.sort();
        candidates.dedup();

        if chosen.len() + candidates.len() < size {
            return Err(RequestError::NotEnoughDevices {
                size,
                available: chosen.len() + candidates.len(),
            });
        }

        while chosen.len() < size {
            let next = best_candidate(&devices, &chosen, &candidates);
            chosen.push(candidates.remove(next));
        }

        Ok(chosen.iter().map(ToString::to_string).collect())
    }

    /// Transitions one device to Unhealthy. Health is monotone within a
    /// plugin session; returns false when the device was already unhealthy
    /// so callers emit each transition at most once.
    pub(crate) fn mark_unhealthy(&self, id: &DeviceId) -> bool {
        let mut devices = self.devices.write().unwrap();
        match devices.get_mut(id) {
            Some(device) if device.health == Health::Healthy => {
                device.health = Health::Unhealthy;
                true
            }
            _ => false,
        }
    }

    /// Blocking health loop. Subscribes to the provider's critical-event
    /// stream and forwards one notification per device health transition to
    /// `sink` until `stop` is signalled or the stream ends.
    pub async fn check_health(
        &self,
        mut stop: watch::Receiver<bool>,
        sink: broadcast::Sender<DeviceId>,
    ) -> anyhow::Result<()> {
        let extra = match self.config.health_checks() {
            HealthChecks::Disabled => {
                info!(resource = %self.resource, "health checks are disabled");
                return Ok(());
            }
            HealthChecks::ExtraIgnoredXids(extra) => extra,
        };
        let mut ignored: BTreeSet<u64> = DEFAULT_IGNORED_XIDS.iter().copied().collect();
        ignored.extend(extra);

        let mut events = self.provider.critical_events().await?;
        debug!(resource = %self.resource, "starting health checks");
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!(resource = %self.resource, "stopping health checks");
                    return Ok(());
                }
                event = events.next() => match event {
                    None => {
                        warn!(resource = %self.resource, "critical event stream ended, health checks are over");
                        return Ok(());
                    }
                    Some(event) => self.handle_event(event, &ignored, &sink),
                }
            }
        }
    }

    fn handle_event(
        &self,
        event: CriticalEvent,
        ignored: &BTreeSet<u64>,
        sink: &broadcast::Sender<DeviceId>,
    ) {
        if ignored.contains(&event.xid) {
            debug!(
                xid = event.xid,
                uuid = ?event.uuid,
                "ignoring event for application-level error"
            );
            return;
        }

        let affected: Vec<DeviceId> = {
            let devices = self.devices.read().unwrap();
            match &event.uuid {
                // An event without a device identifier implicates every
                // device this manager owns
                None => devices.keys().cloned().collect(),
                Some(uuid) => devices
                    .values()
                    .filter(|device| match device.kind {
                        DeviceKind::MigSlice => {
                            device.identity.gpu == *uuid
                                && device.identity.gpu_instance == event.gpu_instance_id
                                && device.identity.compute_instance == event.compute_instance_id
                        }
                        _ => device.identity.gpu == *uuid,
                    })
                    .map(|device| device.id.clone())
                    .collect(),
            }
        };

        for id in affected {
            if self.mark_unhealthy(&id) {
                warn!(
                    resource = %self.resource,
                    device = %id,
                    xid = event.xid,
                    "marking device unhealthy"
                );
                // Nobody listening means no ListAndWatch stream is active;
                // the next stream starts from a snapshot that already
                // carries this transition
                let _ = sink.send(id);
            }
        }
    }
}

/// Index of the best next pick. Candidates must be sorted in canonical
/// order so ties resolve deterministically.
fn best_candidate(
    devices: &BTreeMap<DeviceId, Device>,
    chosen: &[DeviceId],
    candidates: &[DeviceId],
) -> usize {
    let chosen_numa: BTreeSet<i64> = chosen
        .iter()
        .filter_map(|id| devices.get(id).and_then(|d| d.numa_node))
        .collect();

    let score = |index: usize| -> (bool, usize, usize) {
        let candidate = &candidates[index];
        // Prefer candidates on a NUMA node we already picked from
        let numa_miss = match devices.get(candidate).and_then(|d| d.numa_node) {
            Some(node) => !chosen_numa.contains(&node),
            None => true,
        };
        // Spread replica load across backing devices
        let parent_load = chosen
            .iter()
            .filter(|c| c.parent() == candidate.parent())
            .count();
        // Prefer the pick that leaves the remaining replicas of this
        // backing device in the fewest contiguous runs
        let mut remaining: Vec<u32> = candidates
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != index && c.parent() == candidate.parent())
            .filter_map(|(_, c)| c.replica_index())
            .collect();
        remaining.sort_unstable();
        (numa_miss, parent_load, contiguous_runs(&remaining))
    };

    let mut best = 0;
    let mut best_score = score(0);
    for index in 1..candidates.len() {
        let candidate_score = score(index);
        if candidate_score < best_score {
            best = index;
            best_score = candidate_score;
        }
    }
    best
}

fn contiguous_runs(sorted_indices: &[u32]) -> usize {
    let mut runs = 0;
    let mut previous = None;
    for &index in sorted_indices {
        if previous.map_or(true, |p: u32| index != p + 1) {
            runs += 1;
        }
        previous = Some(index);
    }
    runs
}
