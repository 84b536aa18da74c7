#[macro_use]
pub mod common;
pub mod driver;
pub mod jobspec;
pub mod output;
pub mod queue;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::BatchQueueError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

define_id_type!(JobId, u32);

pub const BATCHQ_VERSION: &str = env!("CARGO_PKG_VERSION");
