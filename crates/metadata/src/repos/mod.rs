//! Repository traits for metadata operations.

pub mod caches;
pub mod deletable;
pub mod entries;
pub mod groups;
pub mod namespaces;

pub use caches::CacheRepo;
pub use deletable::DeletableResponseRepo;
pub use entries::EntryRepo;
pub use groups::GroupRepo;
pub use namespaces::NamespaceRepo;
