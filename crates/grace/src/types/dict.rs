//! Open-addressed hash table of key/value pair cells.
//!
//! Cells are `NeverUsed`, `Tombstone`, or `Occupied`; the table grows at a
//! 0.75 load factor and a rehash invalidates outstanding iterators. Occupied
//! cells own a heap [`super::KeyValuePair`] object, which is also what
//! single-variable iteration yields.
//!
//! Because pair keys live behind heap ids, probing reads the heap; the
//! mutating operations are free functions over `(heap, dict_id)` that keep
//! each borrow of the dictionary slot short.

use super::IterRegistry;
use crate::{
    error::{GraceError, RunResult},
    heap::{Heap, HeapId, ObjectData},
    types::KeyValuePair,
    value::Value,
};

const INITIAL_CAPACITY: usize = 8;
const GROW_FACTOR: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    NeverUsed,
    Tombstone,
    Occupied,
}

#[derive(Debug)]
pub struct Dict {
    cells: Vec<Value>,
    states: Vec<CellState>,
    size: usize,
    pub(crate) iterators: IterRegistry,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: (0..INITIAL_CAPACITY).map(|_| Value::Null).collect(),
            states: vec![CellState::NeverUsed; INITIAL_CAPACITY],
            size: 0,
            iterators: IterRegistry::default(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn state(&self, index: usize) -> CellState {
        self.states[index]
    }

    /// The pair object id in an occupied cell.
    #[must_use]
    pub fn pair_at(&self, index: usize) -> Option<HeapId> {
        if self.states[index] == CellState::Occupied
            && let Value::Ref(id) = &self.cells[index]
        {
            Some(*id)
        } else {
            None
        }
    }

    /// Index of the first occupied cell at or after `from`.
    #[must_use]
    pub fn next_occupied(&self, from: usize) -> Option<usize> {
        (from..self.capacity()).find(|i| self.states[*i] == CellState::Occupied)
    }

    pub(crate) fn collect_child_ids(&self, out: &mut Vec<HeapId>) {
        for cell in &self.cells {
            if let Value::Ref(id) = cell {
                out.push(*id);
            }
        }
    }

    pub(crate) fn remove_refs_to(&mut self, target: HeapId) -> usize {
        let mut removed = 0;
        for (i, cell) in self.cells.iter_mut().enumerate() {
            if matches!(cell, Value::Ref(id) if *id == target) {
                *cell = Value::Null;
                self.states[i] = CellState::Tombstone;
                self.size -= 1;
                removed += 1;
            }
        }
        removed
    }
}

/// What the read-only probe decided for an insert.
enum InsertAction {
    NewCell(usize),
    ReplaceValue(HeapId),
}

fn probe_for_insert(heap: &Heap, dict_id: HeapId, key: &Value, hash: u64) -> InsertAction {
    let dict = heap.get(dict_id).as_dict().expect("probing a non-dict");
    let capacity = dict.capacity();
    #[expect(clippy::cast_possible_truncation, reason = "bucket index fits usize")]
    let mut index = (hash % capacity as u64) as usize;
    let mut first_free = None;

    for _ in 0..capacity {
        match dict.state(index) {
            CellState::NeverUsed => {
                return InsertAction::NewCell(first_free.unwrap_or(index));
            }
            CellState::Tombstone => {
                first_free.get_or_insert(index);
            }
            CellState::Occupied => {
                let pair_id = dict.pair_at(index).expect("occupied cell without pair");
                let pair = heap.get(pair_id).as_pair().expect("dict cell is not a pair");
                if pair.key().equals(key) {
                    return InsertAction::ReplaceValue(pair_id);
                }
            }
        }
        index = (index + 1) % capacity;
    }

    // Load factor keeps a free cell around; a full sweep means tombstones.
    InsertAction::NewCell(first_free.expect("dict probe found no free cell"))
}

/// Locates the occupied cell holding `key`, if any.
fn probe_for_key(heap: &Heap, dict_id: HeapId, key: &Value, hash: u64) -> Option<usize> {
    let dict = heap.get(dict_id).as_dict().expect("probing a non-dict");
    let capacity = dict.capacity();
    #[expect(clippy::cast_possible_truncation, reason = "bucket index fits usize")]
    let mut index = (hash % capacity as u64) as usize;

    for _ in 0..capacity {
        match dict.state(index) {
            CellState::NeverUsed => return None,
            CellState::Tombstone => {}
            CellState::Occupied => {
                let pair_id = dict.pair_at(index).expect("occupied cell without pair");
                let pair = heap.get(pair_id).as_pair().expect("dict cell is not a pair");
                if pair.key().equals(key) {
                    return Some(index);
                }
            }
        }
        index = (index + 1) % capacity;
    }

    None
}

fn grow_if_needed(heap: &mut Heap, dict_id: HeapId) -> RunResult<bool> {
    let (size, capacity) = {
        let dict = heap.get(dict_id).as_dict().expect("growing a non-dict");
        (dict.len(), dict.capacity())
    };
    #[expect(clippy::cast_precision_loss, reason = "load factor check")]
    if (size as f32) / (capacity as f32) <= GROW_FACTOR {
        return Ok(false);
    }

    // Collect (pair id, key hash) with the heap readable, then rebuild.
    let mut pairs = Vec::with_capacity(size);
    {
        let dict = heap.get(dict_id).as_dict().expect("growing a non-dict");
        let mut from = 0;
        while let Some(i) = dict.next_occupied(from) {
            let pair_id = dict.pair_at(i).expect("occupied cell without pair");
            let key_hash = heap
                .get(pair_id)
                .as_pair()
                .expect("dict cell is not a pair")
                .key()
                .hash_value()?;
            pairs.push((pair_id, key_hash));
            from = i + 1;
        }
    }

    let new_capacity = capacity * 2;
    let dict = heap
        .get_mut(dict_id)
        .as_dict_mut()
        .expect("growing a non-dict");
    dict.cells = (0..new_capacity).map(|_| Value::Null).collect();
    dict.states = vec![CellState::NeverUsed; new_capacity];
    for (pair_id, hash) in pairs {
        #[expect(clippy::cast_possible_truncation, reason = "bucket index fits usize")]
        let mut index = (hash % new_capacity as u64) as usize;
        while dict.states[index] == CellState::Occupied {
            index = (index + 1) % new_capacity;
        }
        dict.cells[index] = Value::Ref(pair_id);
        dict.states[index] = CellState::Occupied;
    }

    heap.invalidate_iterators(dict_id);
    Ok(true)
}

/// Inserts or overwrites a key. Takes ownership of both values.
pub fn dict_insert(heap: &mut Heap, dict_id: HeapId, key: Value, value: Value) -> RunResult<()> {
    let hash = match key.hash_value() {
        Ok(hash) => hash,
        Err(err) => {
            key.drop_with_heap(heap);
            value.drop_with_heap(heap);
            return Err(err);
        }
    };

    if let Err(err) = grow_if_needed(heap, dict_id) {
        key.drop_with_heap(heap);
        value.drop_with_heap(heap);
        return Err(err);
    }

    match probe_for_insert(heap, dict_id, &key, hash) {
        InsertAction::NewCell(index) => {
            let pair_id = heap.alloc(ObjectData::Pair(KeyValuePair::new(key, value)));
            let dict = heap
                .get_mut(dict_id)
                .as_dict_mut()
                .expect("inserting into a non-dict");
            dict.cells[index] = Value::Ref(pair_id);
            dict.states[index] = CellState::Occupied;
            dict.size += 1;
        }
        InsertAction::ReplaceValue(pair_id) => {
            let old = heap
                .get_mut(pair_id)
                .as_pair_mut()
                .expect("dict cell is not a pair")
                .replace_value(value);
            old.drop_with_heap(heap);
            key.drop_with_heap(heap);
        }
    }
    Ok(())
}

/// Looks a key up, returning a fresh reference to the stored value.
pub fn dict_get(heap: &mut Heap, dict_id: HeapId, key: &Value) -> RunResult<Value> {
    let hash = key.hash_value()?;
    let Some(index) = probe_for_key(heap, dict_id, key, hash) else {
        return Err(GraceError::key_not_found(format!(
            "Dict did not contain key {}",
            key.to_display_string(heap)
        ))
        .into());
    };
    let pair_id = heap
        .get(dict_id)
        .as_dict()
        .and_then(|d| d.pair_at(index))
        .expect("occupied cell without pair");
    let value = heap
        .get(pair_id)
        .as_pair()
        .expect("dict cell is not a pair")
        .value()
        .clone_with_heap(heap);
    Ok(value)
}

pub fn dict_contains_key(heap: &Heap, dict_id: HeapId, key: &Value) -> RunResult<bool> {
    let hash = key.hash_value()?;
    Ok(probe_for_key(heap, dict_id, key, hash).is_some())
}

/// Removes a key if present. Structural mutation: invalidates iterators.
pub fn dict_remove(heap: &mut Heap, dict_id: HeapId, key: &Value) -> RunResult<bool> {
    let hash = key.hash_value()?;
    let Some(index) = probe_for_key(heap, dict_id, key, hash) else {
        return Ok(false);
    };
    let removed = {
        let dict = heap
            .get_mut(dict_id)
            .as_dict_mut()
            .expect("removing from a non-dict");
        let removed = std::mem::replace(&mut dict.cells[index], Value::Null);
        dict.states[index] = CellState::Tombstone;
        dict.size -= 1;
        removed
    };
    removed.drop_with_heap(heap);
    heap.invalidate_iterators(dict_id);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn new_dict(heap: &mut Heap) -> HeapId {
        heap.alloc(ObjectData::Dict(Dict::new()))
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        dict_insert(&mut heap, dict, Value::Str("a".into()), Value::Int(1)).unwrap();
        dict_insert(&mut heap, dict, Value::Str("b".into()), Value::Int(2)).unwrap();
        let got = dict_get(&mut heap, dict, &Value::Str("b".into())).unwrap();
        assert!(matches!(got, Value::Int(2)));
        assert_eq!(heap.get(dict).as_dict().unwrap().len(), 2);
        heap.dec_ref(dict);
    }

    #[test]
    fn overwriting_a_key_keeps_size() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        dict_insert(&mut heap, dict, Value::Int(1), Value::Int(10)).unwrap();
        dict_insert(&mut heap, dict, Value::Int(1), Value::Int(20)).unwrap();
        assert_eq!(heap.get(dict).as_dict().unwrap().len(), 1);
        let got = dict_get(&mut heap, dict, &Value::Int(1)).unwrap();
        assert!(matches!(got, Value::Int(20)));
        heap.dec_ref(dict);
    }

    #[test]
    fn key_equality_widens_between_int_and_float() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        dict_insert(&mut heap, dict, Value::Int(1), Value::Str("one".into())).unwrap();
        let got = dict_get(&mut heap, dict, &Value::Float(1.0)).unwrap();
        assert!(matches!(got, Value::Str(s) if s == "one"));
        heap.dec_ref(dict);
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        assert!(dict_get(&mut heap, dict, &Value::Int(9)).is_err());
        assert!(!dict_contains_key(&heap, dict, &Value::Int(9)).unwrap());
        heap.dec_ref(dict);
    }

    #[test]
    fn null_keys_are_unhashable() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        assert!(dict_insert(&mut heap, dict, Value::Null, Value::Int(1)).is_err());
        heap.dec_ref(dict);
    }

    #[test]
    fn growth_past_load_factor_rehashes_everything() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        for i in 0..64 {
            dict_insert(&mut heap, dict, Value::Int(i), Value::Int(i * 2)).unwrap();
        }
        assert_eq!(heap.get(dict).as_dict().unwrap().len(), 64);
        assert!(heap.get(dict).as_dict().unwrap().capacity() >= 64);
        for i in 0..64 {
            let got = dict_get(&mut heap, dict, &Value::Int(i)).unwrap();
            assert!(matches!(got, Value::Int(v) if v == i * 2));
        }
        heap.dec_ref(dict);
    }

    #[test]
    fn remove_leaves_a_tombstone_that_probing_skips() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        for i in 0..4 {
            dict_insert(&mut heap, dict, Value::Int(i), Value::Int(i)).unwrap();
        }
        assert!(dict_remove(&mut heap, dict, &Value::Int(2)).unwrap());
        assert!(!dict_contains_key(&heap, dict, &Value::Int(2)).unwrap());
        assert!(dict_contains_key(&heap, dict, &Value::Int(3)).unwrap());
        assert_eq!(heap.get(dict).as_dict().unwrap().len(), 3);
        heap.dec_ref(dict);
    }
}
