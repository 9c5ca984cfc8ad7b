//! Slot-arena heap for the reference-counted object kinds.
//!
//! Every `Value::Ref` points at a live slot. Copying a handle increments the
//! slot's refcount, releasing one decrements it, and a count of zero frees
//! the slot and cascades through the object's children. Freed slots are
//! recycled through a free list.
//!
//! Cycles cannot be reclaimed by counting alone. When a decrement leaves a
//! container alive, the heap probes whether every remaining reference to it
//! originates inside its own reachable subgraph; if so, those back-edges are
//! cleared and the ordinary cascade frees the whole group. The language has
//! no closures, so a container stored inside one of its own descendants is
//! the only way to form a cycle.

use std::cell::Cell;

use ahash::AHashSet;

use crate::{
    types::{Dict, ExceptionObj, Instance, IterObject, KeyValuePair, List, Range, Set},
    value::Value,
};

/// Handle to a heap slot. Only valid for the heap that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Payload of a heap slot: one variant per object kind.
#[derive(Debug)]
pub enum ObjectData {
    List(List),
    Dict(Dict),
    Set(Set),
    Range(Range),
    Pair(KeyValuePair),
    Instance(Instance),
    Exception(ExceptionObj),
    Iterator(IterObject),
}

impl ObjectData {
    /// Kind name as reported by `typename()`; instances report their class.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::List(_) => "List",
            Self::Dict(_) => "Dict",
            Self::Set(_) => "Set",
            Self::Range(_) => "Range",
            Self::Pair(_) => "KeyValuePair",
            Self::Instance(instance) => instance.class_name(),
            Self::Exception(_) => "Exception",
            Self::Iterator(_) => "Iterator",
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self {
            Self::List(list) => !list.is_empty(),
            Self::Dict(dict) => !dict.is_empty(),
            Self::Set(set) => !set.is_empty(),
            Self::Range(range) => range.yields_any(),
            Self::Pair(_) | Self::Instance(_) | Self::Exception(_) | Self::Iterator(_) => true,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&List> {
        if let Self::List(list) = self { Some(list) } else { None }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut List> {
        if let Self::List(list) = self { Some(list) } else { None }
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&Dict> {
        if let Self::Dict(dict) = self { Some(dict) } else { None }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        if let Self::Dict(dict) = self { Some(dict) } else { None }
    }

    #[must_use]
    pub fn as_set(&self) -> Option<&Set> {
        if let Self::Set(set) = self { Some(set) } else { None }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut Set> {
        if let Self::Set(set) = self { Some(set) } else { None }
    }

    #[must_use]
    pub fn as_range(&self) -> Option<&Range> {
        if let Self::Range(range) = self { Some(range) } else { None }
    }

    #[must_use]
    pub fn as_pair(&self) -> Option<&KeyValuePair> {
        if let Self::Pair(pair) = self { Some(pair) } else { None }
    }

    pub fn as_pair_mut(&mut self) -> Option<&mut KeyValuePair> {
        if let Self::Pair(pair) = self { Some(pair) } else { None }
    }

    #[must_use]
    pub fn as_instance(&self) -> Option<&Instance> {
        if let Self::Instance(instance) = self { Some(instance) } else { None }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut Instance> {
        if let Self::Instance(instance) = self { Some(instance) } else { None }
    }

    #[must_use]
    pub fn as_exception(&self) -> Option<&ExceptionObj> {
        if let Self::Exception(exception) = self { Some(exception) } else { None }
    }

    #[must_use]
    pub fn as_iterator(&self) -> Option<&IterObject> {
        if let Self::Iterator(iterator) = self { Some(iterator) } else { None }
    }

    pub fn as_iterator_mut(&mut self) -> Option<&mut IterObject> {
        if let Self::Iterator(iterator) = self { Some(iterator) } else { None }
    }

    /// Kinds that can hold references to other objects (and so participate
    /// in cycles). Iterators hold their iterable but can never be a member
    /// of a container, so they are excluded.
    #[must_use]
    fn is_container(&self) -> bool {
        matches!(
            self,
            Self::List(_) | Self::Dict(_) | Self::Set(_) | Self::Pair(_) | Self::Instance(_)
        )
    }

    fn collect_child_ids(&self, out: &mut Vec<HeapId>) {
        match self {
            Self::List(list) => list.collect_child_ids(out),
            Self::Dict(dict) => dict.collect_child_ids(out),
            Self::Set(set) => set.collect_child_ids(out),
            Self::Pair(pair) => pair.collect_child_ids(out),
            Self::Instance(instance) => instance.collect_child_ids(out),
            Self::Iterator(iterator) => out.push(iterator.iterable()),
            Self::Range(_) | Self::Exception(_) => {}
        }
    }

    /// Clears every reference to `target`, returning how many were removed.
    /// Only the cycle probe calls this.
    fn remove_refs_to(&mut self, target: HeapId) -> usize {
        match self {
            Self::List(list) => list.remove_refs_to(target),
            Self::Dict(dict) => dict.remove_refs_to(target),
            Self::Set(set) => set.remove_refs_to(target),
            Self::Pair(pair) => pair.remove_refs_to(target),
            Self::Instance(instance) => instance.remove_refs_to(target),
            Self::Range(_) | Self::Exception(_) | Self::Iterator(_) => 0,
        }
    }

    fn registered_iterators(&self) -> &[HeapId] {
        match self {
            Self::List(list) => list.iterators.registered(),
            Self::Dict(dict) => dict.iterators.registered(),
            Self::Set(set) => set.iterators.registered(),
            Self::Range(range) => range.iterators.registered(),
            _ => &[],
        }
    }

    fn register_iterator(&mut self, iterator: HeapId) {
        match self {
            Self::List(list) => list.iterators.register(iterator),
            Self::Dict(dict) => dict.iterators.register(iterator),
            Self::Set(set) => set.iterators.register(iterator),
            Self::Range(range) => range.iterators.register(iterator),
            _ => {}
        }
    }

    fn deregister_iterator(&mut self, iterator: HeapId) {
        match self {
            Self::List(list) => list.iterators.deregister(iterator),
            Self::Dict(dict) => dict.iterators.deregister(iterator),
            Self::Set(set) => set.iterators.deregister(iterator),
            Self::Range(range) => range.iterators.deregister(iterator),
            _ => {}
        }
    }
}

#[derive(Debug)]
struct HeapSlot {
    refcount: Cell<usize>,
    data: ObjectData,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free_list: Vec<usize>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an object with refcount 1, reusing a freed slot if any.
    pub fn alloc(&mut self, data: ObjectData) -> HeapId {
        let slot = HeapSlot {
            refcount: Cell::new(1),
            data,
        };
        if let Some(index) = self.free_list.pop() {
            self.slots[index] = Some(slot);
            HeapId(index)
        } else {
            self.slots.push(Some(slot));
            HeapId(self.slots.len() - 1)
        }
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &ObjectData {
        &self
            .slots
            .get(id.0)
            .and_then(Option::as_ref)
            .expect("Heap::get: object already freed")
            .data
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut ObjectData {
        &mut self
            .slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .expect("Heap::get_mut: object already freed")
            .data
    }

    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.slots.get(id.0).and_then(Option::as_ref).is_some()
    }

    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .expect("Heap::refcount: object already freed")
            .refcount
            .get()
    }

    /// Number of live objects; the invariant tests assert this returns to
    /// zero when a program finishes.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Increments the refcount. Interior mutability keeps this `&self` so
    /// values can be copied while the heap is otherwise borrowed.
    pub fn inc_ref(&self, id: HeapId) {
        let slot = self
            .slots
            .get(id.0)
            .and_then(Option::as_ref)
            .expect("Heap::inc_ref: object already freed");
        slot.refcount.set(slot.refcount.get() + 1);
    }

    /// Decrements the refcount, freeing the object and cascading through its
    /// children at zero. A decrement that leaves a container alive runs the
    /// cycle probe.
    pub fn dec_ref(&mut self, id: HeapId) {
        let slot = self
            .slots
            .get(id.0)
            .and_then(Option::as_ref)
            .expect("Heap::dec_ref: object already freed");
        let count = slot.refcount.get();
        if count > 1 {
            slot.refcount.set(count - 1);
            self.try_reclaim_cycle(id);
            return;
        }

        let slot = self.slots[id.0].take().expect("Heap::dec_ref: object already freed");
        self.free_list.push(id.0);
        let data = slot.data;

        match &data {
            ObjectData::Iterator(iterator) => {
                let iterable = iterator.iterable();
                if self.is_live(iterable) {
                    self.get_mut(iterable).deregister_iterator(id);
                }
            }
            other => {
                // An iterable dying with iterators registered means the
                // iterator graph was torn down out of order; mark them
                // invalid rather than leaving dangling registrations.
                let registered: Vec<HeapId> = other.registered_iterators().to_vec();
                for iter_id in registered {
                    if self.is_live(iter_id)
                        && let Some(iterator) = self.get_mut(iter_id).as_iterator_mut()
                    {
                        iterator.valid = false;
                    }
                }
            }
        }

        let mut children = Vec::new();
        data.collect_child_ids(&mut children);
        drop(data);
        for child in children {
            if self.is_live(child) {
                self.dec_ref(child);
            }
        }
    }

    /// The "only-reference-is-self" probe.
    ///
    /// Invariant: called after a decrement that left `id` alive. If every
    /// remaining reference to `id` lies inside the subgraph reachable from
    /// `id`, nothing outside can ever see it again; clearing those
    /// back-edges lets the ordinary cascade reclaim the group.
    fn try_reclaim_cycle(&mut self, id: HeapId) {
        {
            let data = self.get(id);
            if !data.is_container() {
                return;
            }
            let mut children = Vec::new();
            data.collect_child_ids(&mut children);
            if children.is_empty() {
                return;
            }
        }

        let mut visited = AHashSet::new();
        visited.insert(id);
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let mut children = Vec::new();
            self.get(node).collect_child_ids(&mut children);
            for child in children {
                if self.is_live(child) && visited.insert(child) {
                    stack.push(child);
                }
            }
        }

        let mut internal_refs = 0;
        for node in &visited {
            let mut children = Vec::new();
            self.get(*node).collect_child_ids(&mut children);
            internal_refs += children.iter().filter(|child| **child == id).count();
        }
        if internal_refs == 0 || internal_refs != self.refcount(id) {
            return;
        }

        let holders: Vec<HeapId> = visited
            .iter()
            .copied()
            .filter(|node| {
                let mut children = Vec::new();
                self.get(*node).collect_child_ids(&mut children);
                children.contains(&id)
            })
            .collect();

        for holder in holders {
            // Earlier removals may already have freed parts of the group.
            if !self.is_live(id) {
                break;
            }
            if !self.is_live(holder) {
                continue;
            }
            let removed = self.get_mut(holder).remove_refs_to(id);
            for _ in 0..removed {
                if self.is_live(id) {
                    self.dec_ref(id);
                }
            }
        }
    }

    // --- iterator plumbing ------------------------------------------------

    pub fn register_iterator(&mut self, iterable: HeapId, iterator: HeapId) {
        self.get_mut(iterable).register_iterator(iterator);
    }

    /// Marks every iterator registered on `iterable` invalid. Called after
    /// structural mutation (append, remove, rehash).
    pub fn invalidate_iterators(&mut self, iterable: HeapId) {
        let registered: Vec<HeapId> = self.get(iterable).registered_iterators().to_vec();
        for iter_id in registered {
            if self.is_live(iter_id)
                && let Some(iterator) = self.get_mut(iter_id).as_iterator_mut()
            {
                iterator.valid = false;
            }
        }
    }

    // --- display ----------------------------------------------------------

    #[must_use]
    pub fn display_object(&self, id: HeapId) -> String {
        self.display_object_guarded(id, &mut Vec::new())
    }

    /// Cycle-safe rendering: an object already on the current path prints as
    /// its elision form instead of recursing forever.
    #[must_use]
    pub(crate) fn display_object_guarded(&self, id: HeapId, on_path: &mut Vec<HeapId>) -> String {
        if on_path.contains(&id) {
            return match self.get(id) {
                ObjectData::List(_) => "[...]".to_owned(),
                ObjectData::Dict(_) | ObjectData::Set(_) => "{...}".to_owned(),
                ObjectData::Pair(_) => "(...)".to_owned(),
                _ => "...".to_owned(),
            };
        }
        on_path.push(id);

        let rendered = match self.get(id) {
            ObjectData::List(list) => {
                let items: Vec<String> = list
                    .items()
                    .iter()
                    .map(|item| item.to_element_string(self, on_path))
                    .collect();
                format!("[{}]", items.join(", "))
            }
            ObjectData::Dict(dict) => {
                let mut parts = Vec::with_capacity(dict.len());
                let mut from = 0;
                while let Some(i) = dict.next_occupied(from) {
                    if let Some(pair_id) = dict.pair_at(i) {
                        parts.push(self.display_object_guarded(pair_id, on_path));
                    }
                    from = i + 1;
                }
                format!("{{{}}}", parts.join(", "))
            }
            ObjectData::Set(set) => {
                let mut parts = Vec::with_capacity(set.len());
                let mut from = 0;
                while let Some(i) = set.next_occupied(from) {
                    if let Some(value) = set.value_at(i) {
                        parts.push(value.to_element_string(self, on_path));
                    }
                    from = i + 1;
                }
                format!("{{{}}}", parts.join(", "))
            }
            ObjectData::Pair(pair) => {
                format!(
                    "{{{}: {}}}",
                    pair.key().to_element_string(self, on_path),
                    pair.value().to_element_string(self, on_path)
                )
            }
            ObjectData::Instance(instance) => {
                let members: Vec<String> = instance
                    .members()
                    .map(|(name, value)| format!("{name}: {}", value.to_element_string(self, on_path)))
                    .collect();
                format!("{} [ {} ]", instance.class_name(), members.join(", "))
            }
            ObjectData::Range(range) => range.display(),
            ObjectData::Exception(exception) => exception.display(),
            ObjectData::Iterator(_) => "<Iterator>".to_owned(),
        };

        on_path.pop();
        rendered
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn alloc_and_release_recycles_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjectData::List(List::default()));
        assert_eq!(heap.live_objects(), 1);
        heap.dec_ref(a);
        assert_eq!(heap.live_objects(), 0);
        let b = heap.alloc(ObjectData::List(List::default()));
        assert_eq!(b.index(), a.index());
        heap.dec_ref(b);
    }

    #[test]
    fn dropping_a_list_releases_its_elements() {
        let mut heap = Heap::new();
        let inner = heap.alloc(ObjectData::List(List::default()));
        let outer = heap.alloc(ObjectData::List(List::from_items(vec![Value::Ref(inner)])));
        assert_eq!(heap.refcount(inner), 1);
        heap.dec_ref(outer);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn shared_elements_survive_container_death() {
        let mut heap = Heap::new();
        let inner = heap.alloc(ObjectData::List(List::default()));
        heap.inc_ref(inner);
        let outer = heap.alloc(ObjectData::List(List::from_items(vec![Value::Ref(inner)])));
        heap.dec_ref(outer);
        assert!(heap.is_live(inner));
        assert_eq!(heap.refcount(inner), 1);
        heap.dec_ref(inner);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn self_referential_list_is_reclaimed() {
        let mut heap = Heap::new();
        let list = heap.alloc(ObjectData::List(List::default()));
        heap.inc_ref(list);
        heap.get_mut(list)
            .as_list_mut()
            .unwrap()
            .push(Value::Ref(list));
        // External handle drops; the only remaining reference is the list's
        // own element, so the probe reclaims it.
        heap.dec_ref(list);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn two_list_cycle_is_reclaimed() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjectData::List(List::default()));
        let b = heap.alloc(ObjectData::List(List::default()));
        heap.inc_ref(b);
        heap.get_mut(a).as_list_mut().unwrap().push(Value::Ref(b));
        heap.inc_ref(a);
        heap.get_mut(b).as_list_mut().unwrap().push(Value::Ref(a));
        // Drop both external handles; a's count falls to 1 (held by b) and
        // the probe from the final decrement clears the loop.
        heap.dec_ref(b);
        heap.dec_ref(a);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn acyclic_shared_graph_is_not_reclaimed_early() {
        let mut heap = Heap::new();
        let shared = heap.alloc(ObjectData::List(List::default()));
        heap.inc_ref(shared);
        heap.inc_ref(shared);
        let a = heap.alloc(ObjectData::List(List::from_items(vec![Value::Ref(shared)])));
        let b = heap.alloc(ObjectData::List(List::from_items(vec![Value::Ref(shared)])));
        heap.dec_ref(a);
        assert!(heap.is_live(shared));
        heap.dec_ref(b);
        assert!(heap.is_live(shared));
        assert_eq!(heap.refcount(shared), 1);
        heap.dec_ref(shared);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn display_elides_cycles() {
        let mut heap = Heap::new();
        let list = heap.alloc(ObjectData::List(List::from_items(vec![Value::Int(1)])));
        heap.inc_ref(list);
        heap.get_mut(list).as_list_mut().unwrap().push(Value::Ref(list));
        assert_eq!(heap.display_object(list), "[1, [...]]");
        // Break the cycle by hand before releasing the external handle.
        let removed = heap.get_mut(list).as_list_mut().unwrap().remove_refs_to(list);
        for _ in 0..removed {
            heap.dec_ref(list);
        }
        heap.dec_ref(list);
        assert_eq!(heap.live_objects(), 0);
    }
}
