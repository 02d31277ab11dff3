use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use domain::service::entity::{Destination, DestinationKey, ServiceKey, VirtualService};
use domain::service::error::TableError;
use ports::secondary::lb_table_port::LbTablePort;

#[derive(Debug, Clone)]
struct StoredService {
    service: VirtualService,
    destinations: HashMap<DestinationKey, Destination>,
}

/// In-memory LB table with the same contract as the kernel binding.
///
/// Reads and writes go through clones, so callers can never mutate stored
/// entries by holding on to a returned value.
#[derive(Debug, Default)]
pub struct MemoryLbTable {
    inner: Mutex<HashMap<ServiceKey, StoredService>>,
}

impl MemoryLbTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceKey, StoredService>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of services currently in the table.
    pub fn service_count(&self) -> usize {
        self.lock().len()
    }
}

impl LbTablePort for MemoryLbTable {
    fn list_services(&self) -> Result<Vec<VirtualService>, TableError> {
        Ok(self.lock().values().map(|s| s.service.clone()).collect())
    }

    fn create_service(&self, service: &VirtualService) -> Result<(), TableError> {
        let mut table = self.lock();
        let key = service.key();
        if table.contains_key(&key) {
            return Err(TableError::AlreadyExists(key.to_string()));
        }
        table.insert(
            key,
            StoredService {
                service: service.clone(),
                destinations: HashMap::new(),
            },
        );
        Ok(())
    }

    fn update_service(&self, service: &VirtualService) -> Result<(), TableError> {
        let mut table = self.lock();
        let key = service.key();
        match table.get_mut(&key) {
            Some(stored) => {
                stored.service = service.clone();
                Ok(())
            }
            None => Err(TableError::NotFound(key.to_string())),
        }
    }

    fn delete_service(&self, key: &ServiceKey) -> Result<(), TableError> {
        match self.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(TableError::NotFound(key.to_string())),
        }
    }

    fn list_destinations(&self, key: &ServiceKey) -> Result<Vec<Destination>, TableError> {
        let table = self.lock();
        let stored = table
            .get(key)
            .ok_or_else(|| TableError::NotFound(key.to_string()))?;
        Ok(stored.destinations.values().cloned().collect())
    }

    fn create_destination(
        &self,
        key: &ServiceKey,
        destination: &Destination,
    ) -> Result<(), TableError> {
        let mut table = self.lock();
        let stored = table
            .get_mut(key)
            .ok_or_else(|| TableError::NotFound(key.to_string()))?;
        let dst_key = destination.key();
        if stored.destinations.contains_key(&dst_key) {
            return Err(TableError::AlreadyExists(format!("{key} -> {dst_key}")));
        }
        stored.destinations.insert(dst_key, destination.clone());
        Ok(())
    }

    fn update_destination(
        &self,
        key: &ServiceKey,
        destination: &Destination,
    ) -> Result<(), TableError> {
        let mut table = self.lock();
        let stored = table
            .get_mut(key)
            .ok_or_else(|| TableError::NotFound(key.to_string()))?;
        let dst_key = destination.key();
        match stored.destinations.get_mut(&dst_key) {
            Some(existing) => {
                *existing = destination.clone();
                Ok(())
            }
            None => Err(TableError::NotFound(format!("{key} -> {dst_key}"))),
        }
    }

    fn delete_destination(
        &self,
        key: &ServiceKey,
        destination: &DestinationKey,
    ) -> Result<(), TableError> {
        let mut table = self.lock();
        let stored = table
            .get_mut(key)
            .ok_or_else(|| TableError::NotFound(key.to_string()))?;
        match stored.destinations.remove(destination) {
            Some(_) => Ok(()),
            None => Err(TableError::NotFound(format!("{key} -> {destination}"))),
        }
    }

    fn flush(&self) -> Result<(), TableError> {
        self.lock().clear();
        Ok(())
    }
}
