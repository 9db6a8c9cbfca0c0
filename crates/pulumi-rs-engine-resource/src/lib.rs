pub mod marshal;
pub mod property;
pub mod provider_ref;
pub mod snapshot;
pub mod state;
pub mod urn;

pub use property::{Archive, Asset, OutputValue, PropertyMap, PropertyValue, ResourceReference};
pub use provider_ref::ProviderReference;
pub use snapshot::{Snapshot, SnapshotError};
pub use state::ResourceState;
pub use urn::Urn;
