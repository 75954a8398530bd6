pub mod service_registry;

pub use service_registry::{
    RegistryStats, ServiceEntry, ServiceHandle, ServiceRegistry, ServiceSnapshot,
};
