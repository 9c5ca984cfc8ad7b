//! A class instance: the class name plus its members in declaration order.

use indexmap::IndexMap;

use crate::{heap::HeapId, value::Value};

#[derive(Debug)]
pub struct Instance {
    class_name: String,
    members: IndexMap<String, Value>,
}

impl Instance {
    /// Builds an instance from already-owned member values.
    #[must_use]
    pub fn new(class_name: String, members: IndexMap<String, Value>) -> Self {
        Self {
            class_name,
            members,
        }
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Value> {
        self.members.get(name)
    }

    /// Replaces a member's value, returning the displaced value for the
    /// caller to release. `None` means no such member exists.
    pub fn set_member(&mut self, name: &str, value: Value) -> Option<Value> {
        let slot = self.members.get_mut(name)?;
        Some(std::mem::replace(slot, value))
    }

    pub fn members(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.members.iter()
    }

    pub(crate) fn collect_child_ids(&self, out: &mut Vec<HeapId>) {
        for value in self.members.values() {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }

    pub(crate) fn remove_refs_to(&mut self, target: HeapId) -> usize {
        let mut removed = 0;
        for value in self.members.values_mut() {
            if matches!(value, Value::Ref(id) if *id == target) {
                *value = Value::Null;
                removed += 1;
            }
        }
        removed
    }
}
