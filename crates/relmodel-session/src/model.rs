//! The trait every mapped type implements.

use crate::mapping::Mapping;

/// A type that can be stored in, or embedded into, a table row.
///
/// Implementations only declare metadata; descriptors are built from it
/// once per type and cached. Loaded instances start from
/// `Default::default()` and are filled from the row.
pub trait Model: Default + Send + Sync + 'static {
    fn mapping(m: &mut Mapping<Self>);
}
