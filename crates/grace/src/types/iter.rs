//! Heap iterator objects backing `for` loops.
//!
//! An iterator owns a strong reference to its iterable, remembers which kind
//! it came from, and registers itself so structural mutation of the iterable
//! can invalidate it. For ranges the cursor holds the current number
//! directly; for the cell-based containers it holds a cell index normalised
//! to the next occupied cell (or the capacity, meaning end).

use crate::{
    error::{ExcKind, GraceError, RunResult},
    heap::{Heap, HeapId, ObjectData},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterTarget {
    List,
    Dict,
    Set,
    Range,
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Index(usize),
    Int(i64),
    Float(f64),
}

#[derive(Debug)]
pub struct IterObject {
    iterable: HeapId,
    target: IterTarget,
    cursor: Cursor,
    pub(crate) valid: bool,
}

impl IterObject {
    #[must_use]
    pub fn iterable(&self) -> HeapId {
        self.iterable
    }
}

fn invalidated() -> GraceError {
    GraceError::new(
        ExcKind::InvalidIterator,
        "Iterator is no longer valid, due to either being incremented past the end of the \
         collection or the collection being modified",
    )
}

/// Creates an iterator over the popped iterable value, transferring that
/// value's reference to the iterator. Registers with the iterable.
pub fn iter_new(heap: &mut Heap, iterable: Value) -> RunResult<HeapId> {
    let Value::Ref(iterable_id) = iterable else {
        let name = iterable.type_name(heap);
        iterable.drop_with_heap(heap);
        return Err(GraceError::invalid_type(format!("`{name}` is not iterable")).into());
    };

    let (target, cursor) = match heap.get(iterable_id) {
        ObjectData::List(_) => (IterTarget::List, Cursor::Index(0)),
        ObjectData::Dict(dict) => {
            let first = dict.next_occupied(0).unwrap_or(dict.capacity());
            (IterTarget::Dict, Cursor::Index(first))
        }
        ObjectData::Set(set) => {
            let first = set.next_occupied(0).unwrap_or(set.capacity());
            (IterTarget::Set, Cursor::Index(first))
        }
        ObjectData::Range(range) => {
            #[expect(clippy::cast_possible_truncation, reason = "integral ranges came from i64s")]
            let cursor = if range.is_integral() {
                Cursor::Int(range.min() as i64)
            } else {
                Cursor::Float(range.min())
            };
            (IterTarget::Range, cursor)
        }
        other => {
            let name = other.type_name().to_owned();
            heap.dec_ref(iterable_id);
            return Err(GraceError::invalid_type(format!("`{name}` is not iterable")).into());
        }
    };

    let iter_id = heap.alloc(ObjectData::Iterator(IterObject {
        iterable: iterable_id,
        target,
        cursor,
        valid: true,
    }));
    heap.register_iterator(iterable_id, iter_id);
    Ok(iter_id)
}

fn iter_state(heap: &Heap, iter_id: HeapId) -> &IterObject {
    heap.get(iter_id)
        .as_iterator()
        .expect("iterator op on a non-iterator")
}

/// Whether the iterator has run off the end of its iterable.
pub fn iter_done(heap: &Heap, iter_id: HeapId) -> bool {
    let iter = iter_state(heap, iter_id);
    match (iter.target, iter.cursor) {
        (IterTarget::List, Cursor::Index(i)) => {
            heap.get(iter.iterable).as_list().is_none_or(|l| i >= l.len())
        }
        (IterTarget::Dict, Cursor::Index(i)) => {
            heap.get(iter.iterable).as_dict().is_none_or(|d| i >= d.capacity())
        }
        (IterTarget::Set, Cursor::Index(i)) => {
            heap.get(iter.iterable).as_set().is_none_or(|s| i >= s.capacity())
        }
        (IterTarget::Range, Cursor::Int(i)) => heap
            .get(iter.iterable)
            .as_range()
            .is_none_or(|r| !r.in_bounds(i as f64)),
        (IterTarget::Range, Cursor::Float(f)) => {
            heap.get(iter.iterable).as_range().is_none_or(|r| !r.in_bounds(f))
        }
        _ => true,
    }
}

/// The value at the cursor: the element for lists and sets, the
/// `KeyValuePair` object for dictionaries, the current number for ranges.
pub fn iter_current(heap: &Heap, iter_id: HeapId) -> RunResult<Value> {
    let iter = iter_state(heap, iter_id);
    if !iter.valid {
        return Err(invalidated().into());
    }
    let value = match (iter.target, iter.cursor) {
        (IterTarget::List, Cursor::Index(i)) => heap
            .get(iter.iterable)
            .as_list()
            .and_then(|l| l.get(i))
            .map(|v| v.clone_with_heap(heap)),
        (IterTarget::Dict, Cursor::Index(i)) => heap
            .get(iter.iterable)
            .as_dict()
            .and_then(|d| d.pair_at(i))
            .map(|pair_id| {
                heap.inc_ref(pair_id);
                Value::Ref(pair_id)
            }),
        (IterTarget::Set, Cursor::Index(i)) => heap
            .get(iter.iterable)
            .as_set()
            .and_then(|s| s.value_at(i))
            .map(|v| v.clone_with_heap(heap)),
        (IterTarget::Range, Cursor::Int(i)) => Some(Value::Int(i)),
        (IterTarget::Range, Cursor::Float(f)) => Some(Value::Float(f)),
        _ => None,
    };
    Ok(value.unwrap_or(Value::Null))
}

/// The key and value at the cursor; only dictionaries support the
/// two-variable form.
pub fn iter_current_pair(heap: &Heap, iter_id: HeapId) -> RunResult<(Value, Value)> {
    let iter = iter_state(heap, iter_id);
    if !iter.valid {
        return Err(invalidated().into());
    }
    if iter.target != IterTarget::Dict {
        let name = heap.get(iter.iterable).type_name().to_owned();
        return Err(GraceError::invalid_type(format!(
            "Can only iterate over a `Dict` with two variables, got `{name}`"
        ))
        .into());
    }
    let Cursor::Index(i) = iter.cursor else {
        return Ok((Value::Null, Value::Null));
    };
    let pair = heap
        .get(iter.iterable)
        .as_dict()
        .and_then(|d| d.pair_at(i))
        .and_then(|pair_id| heap.get(pair_id).as_pair());
    Ok(pair.map_or((Value::Null, Value::Null), |pair| {
        (
            pair.key().clone_with_heap(heap),
            pair.value().clone_with_heap(heap),
        )
    }))
}

/// Advances the cursor by one element (or one increment for ranges).
pub fn iter_advance(heap: &mut Heap, iter_id: HeapId) -> RunResult<()> {
    let iter = iter_state(heap, iter_id);
    if !iter.valid {
        return Err(invalidated().into());
    }
    let next = match (iter.target, iter.cursor) {
        (IterTarget::List, Cursor::Index(i)) => Cursor::Index(i + 1),
        (IterTarget::Dict, Cursor::Index(i)) => {
            let dict = heap.get(iter.iterable).as_dict().expect("dict iterator");
            Cursor::Index(dict.next_occupied(i + 1).unwrap_or(dict.capacity()))
        }
        (IterTarget::Set, Cursor::Index(i)) => {
            let set = heap.get(iter.iterable).as_set().expect("set iterator");
            Cursor::Index(set.next_occupied(i + 1).unwrap_or(set.capacity()))
        }
        (IterTarget::Range, Cursor::Int(i)) => {
            let range = heap.get(iter.iterable).as_range().expect("range iterator");
            #[expect(clippy::cast_possible_truncation, reason = "integral ranges came from i64s")]
            let increment = range.increment() as i64;
            Cursor::Int(i.wrapping_add(increment))
        }
        (IterTarget::Range, Cursor::Float(f)) => {
            let range = heap.get(iter.iterable).as_range().expect("range iterator");
            Cursor::Float(f + range.increment())
        }
        (_, cursor) => cursor,
    };
    heap.get_mut(iter_id)
        .as_iterator_mut()
        .expect("iterator op on a non-iterator")
        .cursor = next;
    Ok(())
}
