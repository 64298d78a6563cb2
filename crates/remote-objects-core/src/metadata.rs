//! Object role and type descriptor cache.
//!
//! Every payload the server sends is walked once on arrival. Type ids found
//! anywhere in the payload tree are marked as type objects before the ids
//! that reference them are finalized, so a type seen only as a nested
//! reference is never fetched again.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::protocol::{Attributes, Descriptor, ObjectId};

/// Role of a remote object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRole {
    /// Ordinary instance.
    Target,
    /// Descriptor of the methods available on instances of a type.
    Type,
}

/// Outcome of a type attribute lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeLookup {
    /// Answered from the cache.
    Resolved(Attributes),
    /// The type descriptor has to be fetched from the server.
    Fetch(ObjectId),
}

enum Visit {
    Enter(Descriptor),
    Leave(Descriptor),
}

/// Role map and type payload cache.
///
/// Both maps are append-only: the first role learned for an id is kept.
#[derive(Debug, Default)]
pub struct MetadataCache {
    roles: HashMap<ObjectId, ObjectRole>,
    types: HashMap<ObjectId, Descriptor>,
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Role learned for an id.
    #[must_use]
    pub fn role(&self, id: ObjectId) -> Option<ObjectRole> {
        self.roles.get(&id).copied()
    }

    /// Cached type descriptor.
    #[must_use]
    pub fn type_payload(&self, id: ObjectId) -> Option<&Descriptor> {
        self.types.get(&id)
    }

    /// Number of cached type descriptors.
    #[must_use]
    pub fn cached_types(&self) -> usize {
        self.types.len()
    }

    /// Mark an id as a type object unless its role is already known.
    pub fn mark_type(&mut self, id: ObjectId) {
        self.roles.entry(id).or_insert(ObjectRole::Type);
    }

    /// Record the metadata carried by one payload.
    ///
    /// Payloads that are not descriptors are ignored.
    pub fn ingest(&mut self, payload: &Value) {
        let Some(root) = Descriptor::from_value(payload) else {
            return;
        };

        let mut visited = HashSet::new();
        let mut stack = vec![Visit::Enter(root)];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(descriptor) => {
                    if !visited.insert(descriptor.id) {
                        continue;
                    }
                    if let Some(type_id) = descriptor.type_id {
                        self.mark_type(type_id);
                    }

                    let children: Vec<Descriptor> =
                        descriptor.value.values().filter_map(Descriptor::nested).collect();
                    stack.push(Visit::Leave(descriptor));
                    stack.extend(children.into_iter().rev().map(Visit::Enter));
                }
                Visit::Leave(descriptor) => self.finalize(descriptor),
            }
        }
    }

    fn finalize(&mut self, descriptor: Descriptor) {
        match *self.roles.entry(descriptor.id).or_insert(ObjectRole::Target) {
            ObjectRole::Type => {
                self.types.entry(descriptor.id).or_insert(descriptor);
            }
            ObjectRole::Target => {}
        }
    }

    /// Look up the type attributes of an instance.
    ///
    /// Marks the instance's type id as a type object if it was unknown.
    /// Type objects resolve to an empty mapping: they describe methods
    /// directly and have no type of their own to consult.
    pub fn lookup(&mut self, instance: &Descriptor) -> TypeLookup {
        if let Some(type_id) = instance.type_id {
            self.mark_type(type_id);
        }

        if self.role(instance.id) == Some(ObjectRole::Type) {
            return TypeLookup::Resolved(Attributes::new());
        }

        let Some(type_id) = instance.type_id else {
            return TypeLookup::Resolved(Attributes::new());
        };

        match self.types.get(&type_id) {
            Some(descriptor) => TypeLookup::Resolved(descriptor.value.clone()),
            None => TypeLookup::Fetch(type_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn descriptor(value: &Value) -> Descriptor {
        Descriptor::from_value(value).unwrap()
    }

    #[test]
    fn test_result_payload_roles() {
        let mut cache = MetadataCache::new();
        cache.ingest(&json!({"i": 42, "t": 43, "v": {}}));

        assert_eq!(cache.role(ObjectId(42)), Some(ObjectRole::Target));
        assert_eq!(cache.role(ObjectId(43)), Some(ObjectRole::Type));
        assert_eq!(cache.cached_types(), 0);
    }

    #[test]
    fn test_control_payloads_cache_root_type() {
        let root = json!({"i": 4, "t": 5, "v": {"foo": "bar"}});
        let root_type = json!({"i": 5, "t": 3, "v": {"be_a_robot": {}, "be_a_person": {}}});

        let mut cache = MetadataCache::new();
        cache.ingest(&root);
        cache.ingest(&root_type);

        assert_eq!(cache.role(ObjectId(5)), Some(ObjectRole::Type));
        assert_eq!(cache.role(ObjectId(3)), Some(ObjectRole::Type));
        assert!(cache.type_payload(ObjectId(5)).is_some());

        match cache.lookup(&descriptor(&root)) {
            TypeLookup::Resolved(values) => {
                assert!(values.contains_key("be_a_robot"));
                assert!(values.contains_key("be_a_person"));
            }
            TypeLookup::Fetch(id) => panic!("Expected cache hit, fetching {id}"),
        }
    }

    #[test]
    fn test_type_objects_resolve_empty() {
        let root_type = json!({"i": 5, "t": 3, "v": {"be_a_robot": {}}});
        let mut cache = MetadataCache::new();
        cache.ingest(&json!({"i": 4, "t": 5, "v": {}}));
        cache.ingest(&root_type);

        assert_eq!(
            cache.lookup(&descriptor(&root_type)),
            TypeLookup::Resolved(Attributes::new())
        );
    }

    #[test]
    fn test_unknown_type_marks_and_fetches() {
        let mut cache = MetadataCache::new();
        let instance = descriptor(&json!({"i": 42, "t": 101, "v": {"bar": "baz"}}));

        assert_eq!(cache.lookup(&instance), TypeLookup::Fetch(ObjectId(101)));
        assert_eq!(cache.role(ObjectId(101)), Some(ObjectRole::Type));

        cache.ingest(&json!({"i": 101, "t": 3, "v": {"baz": {}}}));
        match cache.lookup(&instance) {
            TypeLookup::Resolved(values) => assert!(values.contains_key("baz")),
            TypeLookup::Fetch(_) => panic!("Expected cache hit after ingest"),
        }
    }

    #[test]
    fn test_nested_type_marked_before_parent_finalized() {
        let mut cache = MetadataCache::new();
        cache.ingest(&json!({
            "i": 1,
            "t": 2,
            "v": {
                "pipette": {"i": 10, "t": 11, "v": {"volume": 200}},
                "name": "robot"
            }
        }));

        assert_eq!(cache.role(ObjectId(1)), Some(ObjectRole::Target));
        assert_eq!(cache.role(ObjectId(10)), Some(ObjectRole::Target));
        assert_eq!(cache.role(ObjectId(11)), Some(ObjectRole::Type));
    }

    #[test]
    fn test_nested_type_payload_is_cached() {
        let mut cache = MetadataCache::new();
        // The child's own type is the nested payload itself.
        cache.ingest(&json!({
            "i": 1,
            "t": 2,
            "v": {
                "kind": {"i": 2, "t": 3, "v": {"home": {}}}
            }
        }));

        assert_eq!(cache.role(ObjectId(2)), Some(ObjectRole::Type));
        assert_eq!(
            cache.type_payload(ObjectId(2)).map(|d| d.value.contains_key("home")),
            Some(true)
        );

        let instance = descriptor(&json!({"i": 7, "t": 2, "v": {}}));
        assert!(matches!(cache.lookup(&instance), TypeLookup::Resolved(_)));
    }

    #[test]
    fn test_roles_are_append_only() {
        let mut cache = MetadataCache::new();
        cache.ingest(&json!({"i": 42, "t": 43, "v": {}}));
        cache.mark_type(ObjectId(42));
        assert_eq!(cache.role(ObjectId(42)), Some(ObjectRole::Target));
    }

    #[test]
    fn test_repeated_ids_visited_once() {
        let mut cache = MetadataCache::new();
        cache.ingest(&json!({
            "i": 1,
            "t": 2,
            "v": {
                "a": {"i": 1, "t": 2, "v": {}},
                "b": {"i": 1, "t": 2, "v": {}}
            }
        }));
        assert_eq!(cache.role(ObjectId(1)), Some(ObjectRole::Target));
    }

    #[test]
    fn test_non_descriptors_ignored() {
        let mut cache = MetadataCache::new();
        cache.ingest(&json!("ahhh"));
        cache.ingest(&Value::Null);
        cache.ingest(&json!({"t": 3, "v": {}}));
        assert_eq!(cache.role(ObjectId(3)), None);
    }

    #[test]
    fn test_deep_nesting() {
        let mut payload = json!({"i": 0, "t": 1_000_000, "v": {}});
        for depth in 1..200u64 {
            payload = json!({"i": depth, "t": 1_000_000 + depth, "v": {"child": payload}});
        }

        let mut cache = MetadataCache::new();
        cache.ingest(&payload);
        assert_eq!(cache.role(ObjectId(0)), Some(ObjectRole::Target));
        assert_eq!(cache.role(ObjectId(1_000_000)), Some(ObjectRole::Type));
    }
}
