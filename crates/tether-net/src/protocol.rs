//! Type-indexed protocol id lookup used by [`Session::send`](crate::Session::send).

use std::any::{TypeId, type_name};
use std::collections::HashMap;

/// Maps outbound message types to their wire protocol id.
///
/// Built once by the application and shared (behind an `Arc`) by every
/// session that sends those messages.
#[derive(Debug, Default, Clone)]
pub struct ProtocolTable {
    ids: HashMap<TypeId, (u16, &'static str)>,
}

impl ProtocolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate message type `M` with `id`. Re-registering replaces the id.
    pub fn register<M: 'static>(&mut self, id: u16) -> &mut Self {
        self.ids.insert(TypeId::of::<M>(), (id, type_name::<M>()));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<M: 'static>(mut self, id: u16) -> Self {
        self.register::<M>(id);
        self
    }

    /// Protocol id for `M`, if registered.
    pub fn resolve<M: 'static>(&self) -> Option<u16> {
        self.ids.get(&TypeId::of::<M>()).map(|(id, _)| *id)
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no message type is registered.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate `(type name, id)` pairs, for startup logging.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, u16)> + '_ {
        self.ids.values().map(|(id, name)| (*name, *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Login;
    struct Echo;
    struct Unregistered;

    #[test]
    fn test_resolve_registered_types() {
        let table = ProtocolTable::new().with::<Login>(1).with::<Echo>(2);
        assert_eq!(table.resolve::<Login>(), Some(1));
        assert_eq!(table.resolve::<Echo>(), Some(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unregistered_type_resolves_to_none() {
        let table = ProtocolTable::new().with::<Login>(1);
        assert_eq!(table.resolve::<Unregistered>(), None);
    }

    #[test]
    fn test_reregister_replaces_id() {
        let mut table = ProtocolTable::new();
        table.register::<Echo>(2).register::<Echo>(7);
        assert_eq!(table.resolve::<Echo>(), Some(7));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entries_name_the_type() {
        let table = ProtocolTable::new().with::<Echo>(5);
        let entries: Vec<_> = table.entries().collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.ends_with("Echo"));
        assert_eq!(entries[0].1, 5);
    }
}
