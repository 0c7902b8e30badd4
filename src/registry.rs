//! Known picture banks and the subset currently open.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};

use crate::bank::PictureBank;
use crate::config::{Config, PictureBankConfig};
use crate::error::RegistryError;
use crate::events::{BankEvent, EventBus, SubscriberId};

#[derive(Default)]
struct RegistryState {
    configs: BTreeMap<u32, PictureBankConfig>,
    open: BTreeMap<u32, Arc<PictureBank>>,
}

/// Set of registered bank configurations and the banks opened from them.
///
/// Every change to either set publishes [`BankEvent::BankListChanged`]. The
/// same bus is handed to each opened bank, so one subscription sees the
/// events of every selected bank as well.
pub struct BankRegistry {
    state: Mutex<RegistryState>,
    bus: Arc<EventBus>,
}

impl BankRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            bus,
        }
    }

    /// Registry knowing every bank listed in `config`. Nothing is opened.
    pub fn from_config(config: &Config, bus: Arc<EventBus>) -> Self {
        let registry = Self::new(bus);
        {
            let mut state = registry.lock();
            for bank in &config.banks {
                state.configs.insert(bank.picture_bank_id, bank.clone());
            }
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) {
        self.bus.publish(BankEvent::BankListChanged);
    }

    /// Add or replace a bank configuration. An open bank keeps running with
    /// the configuration it was opened with until it is selected again.
    pub fn register(&self, config: PictureBankConfig) -> Option<PictureBankConfig> {
        let previous = self.lock().configs.insert(config.picture_bank_id, config);
        self.changed();
        previous
    }

    /// Forget a bank, closing it first if it is open.
    pub fn unregister(&self, id: u32) -> Result<PictureBankConfig, RegistryError> {
        let (config, bank) = {
            let mut state = self.lock();
            let config = state
                .configs
                .remove(&id)
                .ok_or(RegistryError::UnknownPictureBank(id))?;
            (config, state.open.remove(&id))
        };
        if let Some(bank) = bank {
            bank.close();
        }
        tracing::info!(bank_id = id, "Unregistered picture bank");
        self.changed();
        Ok(config)
    }

    /// Make `ids` the open set: banks not listed are closed, listed banks not
    /// yet open are opened. Unknown ids and banks that fail to open are
    /// logged and left out. Returns the resulting selection.
    ///
    /// Banks are opened and closed without holding the registry lock.
    pub fn select(&self, ids: &[u32]) -> Vec<u32> {
        let wanted: BTreeSet<u32> = ids.iter().copied().collect();

        let (mut closing, to_open) = {
            let mut state = self.lock();
            let deselected: Vec<u32> = state
                .open
                .keys()
                .filter(|id| !wanted.contains(id))
                .copied()
                .collect();
            let closing: Vec<Arc<PictureBank>> = deselected
                .iter()
                .filter_map(|id| state.open.remove(id))
                .collect();

            let mut to_open = Vec::new();
            for &id in &wanted {
                if state.open.contains_key(&id) {
                    continue;
                }
                match state.configs.get(&id) {
                    Some(config) => to_open.push(config.clone()),
                    None => {
                        tracing::warn!(bank_id = id, "Cannot select unregistered picture bank")
                    }
                }
            }
            (closing, to_open)
        };
        let deselected = closing.len();

        let opened: Vec<Arc<PictureBank>> = to_open
            .into_iter()
            .filter_map(|config| {
                let id = config.picture_bank_id;
                match PictureBank::open(config, Arc::clone(&self.bus)) {
                    Ok(bank) => Some(Arc::new(bank)),
                    Err(e) => {
                        tracing::error!(bank_id = id, error = %e, "Failed to open picture bank");
                        None
                    }
                }
            })
            .collect();

        let mut changed = false;
        {
            let mut state = self.lock();
            for bank in opened {
                if state.open.contains_key(&bank.id()) {
                    // Opened concurrently by another select
                    closing.push(bank);
                } else {
                    state.open.insert(bank.id(), bank);
                    changed = true;
                }
            }
        }

        for (i, bank) in closing.iter().enumerate() {
            bank.close();
            if i < deselected {
                tracing::info!(bank_id = bank.id(), "Deselected picture bank");
            }
        }

        if changed || deselected > 0 {
            self.changed();
        }
        self.selected()
    }

    /// Ids of the open banks, ascending.
    pub fn selected(&self) -> Vec<u32> {
        self.lock().open.keys().copied().collect()
    }

    pub fn bank(&self, id: u32) -> Result<Arc<PictureBank>, RegistryError> {
        self.lock()
            .open
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NoOpenPictureBank(id))
    }

    /// Every registered configuration, ordered by bank id.
    pub fn all_configs(&self) -> Vec<PictureBankConfig> {
        self.lock().configs.values().cloned().collect()
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<BankEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Close every open bank. Registrations are kept.
    pub fn close_all(&self) {
        let banks = std::mem::take(&mut self.lock().open);
        if banks.is_empty() {
            return;
        }
        for bank in banks.values() {
            bank.close();
        }
        self.changed();
    }
}

impl Drop for BankRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
