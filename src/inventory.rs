//! Keeps the fleet in line with the machine inventory.
//!
//! The inventory file is re-read periodically. Each pass adds new machines,
//! hands them their PDU port (which makes them IDLE), refreshes tags and
//! retires machines that are no longer listed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Inventory, MachineEntry, load_inventory};
use crate::fleet::Fleet;
use crate::pdu::{Pdu, PduPort};

/// What a sync pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub ports_assigned: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.ports_assigned.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Outlet {
    pdu: String,
    port_id: String,
    min_off_time_secs: f64,
}

pub struct InventorySync {
    fleet: Arc<Fleet>,
    pdus: BTreeMap<String, Arc<dyn Pdu>>,
    path: PathBuf,
    interval: Duration,
    assigned: HashMap<String, Outlet>,
}

impl InventorySync {
    pub fn new(
        fleet: Arc<Fleet>,
        pdus: BTreeMap<String, Arc<dyn Pdu>>,
        path: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            fleet,
            pdus,
            path,
            interval,
            assigned: HashMap::new(),
        }
    }

    /// Reloads the inventory file and applies it.
    pub async fn sync_once(&mut self) -> anyhow::Result<SyncReport> {
        let inventory = load_inventory(&self.path)?;
        Ok(self.apply(&inventory).await)
    }

    /// Makes the fleet match `inventory`.
    pub async fn apply(&mut self, inventory: &Inventory) -> SyncReport {
        let mut report = SyncReport::default();
        let mut listed = HashSet::new();
        let mut outlets: HashMap<(String, String), String> = HashMap::new();

        for entry in &inventory.machines {
            if !listed.insert(entry.id.clone()) {
                warn!("Machine {} is listed twice, ignoring the duplicate", entry.id);
                continue;
            }

            let machine = match self.fleet.get(&entry.id) {
                Some(machine) => {
                    machine.set_tags(entry.tags.clone());
                    machine
                }
                None => {
                    report.added.push(entry.id.clone());
                    self.fleet.add_machine(&entry.id, entry.tags.clone())
                }
            };
            machine.set_local_tty_device(entry.local_tty_device.clone());

            let Some(outlet) = outlet_of(entry) else {
                debug!("Machine {} has no PDU port yet", entry.id);
                continue;
            };

            let key = (outlet.pdu.clone(), outlet.port_id.clone());
            if let Some(owner) = outlets.get(&key) {
                warn!(
                    "Machines {} and {} share {}/{}, not assigning it to {}",
                    owner, entry.id, outlet.pdu, outlet.port_id, entry.id
                );
                continue;
            }
            outlets.insert(key, entry.id.clone());

            if self.assigned.get(&entry.id) == Some(&outlet) {
                continue;
            }

            let Some(pdu) = self.pdus.get(&outlet.pdu) else {
                warn!("Machine {} refers to unknown PDU {}", entry.id, outlet.pdu);
                continue;
            };
            let min_off_time = match Duration::try_from_secs_f64(outlet.min_off_time_secs) {
                Ok(duration) => duration,
                Err(e) => {
                    warn!("Machine {} has an invalid min_off_time_secs: {}", entry.id, e);
                    continue;
                }
            };

            let port = PduPort::new(pdu.clone(), outlet.port_id.clone(), min_off_time)
                .with_label(entry.id.clone());
            match machine.assign_port(port) {
                Ok(()) => {
                    report.ports_assigned.push(entry.id.clone());
                    self.assigned.insert(entry.id.clone(), outlet);
                }
                Err(e) => warn!("Failed to assign a port to {}: {}", entry.id, e),
            }
        }

        for id in self.fleet.ids() {
            if !listed.contains(&id) {
                self.fleet.remove(&id).await;
                self.assigned.remove(&id);
                report.removed.push(id);
            }
        }

        if !report.is_empty() {
            info!(
                "Inventory sync: {} added, {} removed, {} ports assigned",
                report.added.len(),
                report.removed.len(),
                report.ports_assigned.len()
            );
        }
        report
    }

    /// Syncs every `interval` until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sync_once().await {
                warn!("Inventory sync failed: {:#}", e);
            }
        }
    }
}

fn outlet_of(entry: &MachineEntry) -> Option<Outlet> {
    Some(Outlet {
        pdu: entry.pdu.clone()?,
        port_id: entry.port_id.clone()?,
        min_off_time_secs: entry.min_off_time_secs,
    })
}
