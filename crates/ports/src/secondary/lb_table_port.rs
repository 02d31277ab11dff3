use domain::service::entity::{Destination, DestinationKey, ServiceKey, VirtualService};
use domain::service::error::TableError;

/// Secondary port for the kernel LB table.
///
/// Implemented by the netlink binding on Linux and by an in-memory table
/// everywhere, with identical CRUD semantics. Implementations serialize
/// their operations internally; callers may share one instance across tasks.
pub trait LbTablePort: Send + Sync {
    /// Snapshot of all virtual services, including ones this control plane
    /// does not manage.
    fn list_services(&self) -> Result<Vec<VirtualService>, TableError>;

    /// Create a new virtual service. Fails with `AlreadyExists` if the
    /// service key is present.
    fn create_service(&self, service: &VirtualService) -> Result<(), TableError>;

    /// Update the mutable fields (scheduler, timeout) of an existing service.
    fn update_service(&self, service: &VirtualService) -> Result<(), TableError>;

    /// Delete a service and, with it, all of its destinations.
    fn delete_service(&self, key: &ServiceKey) -> Result<(), TableError>;

    /// Snapshot of the destinations under an existing service.
    fn list_destinations(&self, key: &ServiceKey) -> Result<Vec<Destination>, TableError>;

    /// Add a destination to an existing service.
    fn create_destination(
        &self,
        key: &ServiceKey,
        destination: &Destination,
    ) -> Result<(), TableError>;

    /// Update the mutable fields (weight, forwarding method) of a destination.
    fn update_destination(
        &self,
        key: &ServiceKey,
        destination: &Destination,
    ) -> Result<(), TableError>;

    /// Remove a destination from a service.
    fn delete_destination(
        &self,
        key: &ServiceKey,
        destination: &DestinationKey,
    ) -> Result<(), TableError>;

    /// Remove every service and destination from the table.
    fn flush(&self) -> Result<(), TableError>;
}
