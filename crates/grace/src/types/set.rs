//! Open-addressed hash set of bare values.
//!
//! Same cell discipline as the dictionary (`NeverUsed` / `Tombstone` /
//! `Occupied`, 0.75 grow factor, rehash invalidates iterators), storing the
//! values directly in the cells.

use super::{CellState, IterRegistry};
use crate::{
    error::RunResult,
    heap::{Heap, HeapId},
    value::Value,
};

const INITIAL_CAPACITY: usize = 8;
const GROW_FACTOR: f32 = 0.75;

#[derive(Debug)]
pub struct Set {
    cells: Vec<Value>,
    states: Vec<CellState>,
    size: usize,
    pub(crate) iterators: IterRegistry,
}

impl Default for Set {
    fn default() -> Self {
        Self::new()
    }
}

impl Set {
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

    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        if self.states[index] == CellState::Occupied {
            Some(&self.cells[index])
        } else {
            None
        }
    }

    /// Index of the first occupied cell at or after `from`.
    #[must_use]
    pub fn next_occupied(&self, from: usize) -> Option<usize> {
        (from..self.capacity()).find(|i| self.states[*i] == CellState::Occupied)
    }

    fn probe(&self, value: &Value, hash: u64) -> Probe {
        let capacity = self.capacity();
        #[expect(clippy::cast_possible_truncation, reason = "bucket index fits usize")]
        let mut index = (hash % capacity as u64) as usize;
        let mut first_free = None;

        for _ in 0..capacity {
            match self.states[index] {
                CellState::NeverUsed => {
                    return Probe::Missing(first_free.unwrap_or(index));
                }
                CellState::Tombstone => {
                    first_free.get_or_insert(index);
                }
                CellState::Occupied => {
                    if self.cells[index].equals(value) {
                        return Probe::Present(index);
                    }
                }
            }
            index = (index + 1) % capacity;
        }

        Probe::Missing(first_free.expect("set probe found no free cell"))
    }

    fn rehash(&mut self) -> RunResult<()> {
        let new_capacity = self.capacity() * 2;
        let old_cells = std::mem::replace(
            &mut self.cells,
            (0..new_capacity).map(|_| Value::Null).collect(),
        );
        let old_states = std::mem::replace(&mut self.states, vec![CellState::NeverUsed; new_capacity]);

        for (cell, state) in old_cells.into_iter().zip(old_states) {
            if state != CellState::Occupied {
                continue;
            }
            let hash = cell.hash_value()?;
            #[expect(clippy::cast_possible_truncation, reason = "bucket index fits usize")]
            let mut index = (hash % new_capacity as u64) as usize;
            while self.states[index] == CellState::Occupied {
                index = (index + 1) % new_capacity;
            }
            self.cells[index] = cell;
            self.states[index] = CellState::Occupied;
        }
        Ok(())
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

enum Probe {
    Present(usize),
    Missing(usize),
}

/// Adds a value, taking ownership; duplicates are released.
pub fn set_add(heap: &mut Heap, set_id: HeapId, value: Value) -> RunResult<()> {
    let hash = match value.hash_value() {
        Ok(hash) => hash,
        Err(err) => {
            value.drop_with_heap(heap);
            return Err(err);
        }
    };

    #[expect(clippy::cast_precision_loss, reason = "load factor check")]
    let needs_growth = {
        let set = heap.get(set_id).as_set().expect("adding to a non-set");
        (set.len() as f32) / (set.capacity() as f32) > GROW_FACTOR
    };
    if needs_growth {
        let result = heap
            .get_mut(set_id)
            .as_set_mut()
            .expect("adding to a non-set")
            .rehash();
        if let Err(err) = result {
            value.drop_with_heap(heap);
            return Err(err);
        }
        heap.invalidate_iterators(set_id);
    }

    let probe = heap
        .get(set_id)
        .as_set()
        .expect("adding to a non-set")
        .probe(&value, hash);
    match probe {
        Probe::Present(_) => value.drop_with_heap(heap),
        Probe::Missing(index) => {
            let set = heap.get_mut(set_id).as_set_mut().expect("adding to a non-set");
            set.cells[index] = value;
            set.states[index] = CellState::Occupied;
            set.size += 1;
        }
    }
    Ok(())
}

pub fn set_contains(heap: &Heap, set_id: HeapId, value: &Value) -> RunResult<bool> {
    let hash = value.hash_value()?;
    let set = heap.get(set_id).as_set().expect("probing a non-set");
    Ok(matches!(set.probe(value, hash), Probe::Present(_)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::heap::ObjectData;

    fn new_set(heap: &mut Heap) -> HeapId {
        heap.alloc(ObjectData::Set(Set::new()))
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut heap = Heap::new();
        let set = new_set(&mut heap);
        set_add(&mut heap, set, Value::Int(1)).unwrap();
        set_add(&mut heap, set, Value::Int(1)).unwrap();
        set_add(&mut heap, set, Value::Int(2)).unwrap();
        assert_eq!(heap.get(set).as_set().unwrap().len(), 2);
        heap.dec_ref(set);
    }

    #[test]
    fn int_and_equal_float_are_one_element() {
        let mut heap = Heap::new();
        let set = new_set(&mut heap);
        set_add(&mut heap, set, Value::Int(3)).unwrap();
        set_add(&mut heap, set, Value::Float(3.0)).unwrap();
        assert_eq!(heap.get(set).as_set().unwrap().len(), 1);
        assert!(set_contains(&heap, set, &Value::Float(3.0)).unwrap());
        heap.dec_ref(set);
    }

    #[test]
    fn growth_preserves_membership() {
        let mut heap = Heap::new();
        let set = new_set(&mut heap);
        for i in 0..50 {
            set_add(&mut heap, set, Value::Int(i)).unwrap();
        }
        for i in 0..50 {
            assert!(set_contains(&heap, set, &Value::Int(i)).unwrap());
        }
        assert_eq!(heap.get(set).as_set().unwrap().len(), 50);
        heap.dec_ref(set);
    }
}
