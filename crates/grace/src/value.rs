//! The runtime value: a tagged union over the six primitives and a handle
//! into the object heap.
//!
//! NOTE: `Clone` is intentionally not derived. Copying a `Ref` must go
//! through [`Value::clone_with_heap`] so the refcount is incremented, and
//! destruction through [`Value::drop_with_heap`] so it is decremented.
//! Primitive-only copies use [`Value::clone_primitive`].

use strum::{Display, IntoStaticStr};

use crate::{
    error::{ExcKind, GraceError, RunResult},
    hashing,
    heap::{Heap, HeapId, ObjectData},
    types::List,
};

/// Primitive type tag, also the spelling `typename()` reports for
/// non-object values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum Type {
    Bool,
    Char,
    Float,
    Int,
    Null,
    String,
    Object,
}

#[derive(Debug)]
pub enum Value {
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
    Ref(HeapId),
}

impl Value {
    #[must_use]
    pub fn type_of(&self) -> Type {
        match self {
            Self::Bool(_) => Type::Bool,
            Self::Char(_) => Type::Char,
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Str(_) => Type::String,
            Self::Null => Type::Null,
            Self::Ref(_) => Type::Object,
        }
    }

    /// Type name for diagnostics and `typename()`: the canonical primitive
    /// name, or the object's kind name (the class name for instances).
    #[must_use]
    pub fn type_name(&self, heap: &Heap) -> String {
        match self {
            Self::Ref(id) => heap.get(*id).type_name().to_owned(),
            other => other.type_of().to_string(),
        }
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Copies a primitive value. Panics on `Ref`; heap handles must be copied
    /// with [`Value::clone_with_heap`].
    #[must_use]
    pub fn clone_primitive(&self) -> Self {
        match self {
            Self::Bool(b) => Self::Bool(*b),
            Self::Char(c) => Self::Char(*c),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::Str(s) => Self::Str(s.clone()),
            Self::Null => Self::Null,
            Self::Ref(_) => panic!("clone_primitive called on a heap handle"),
        }
    }

    /// Copies any value, incrementing the refcount for heap handles.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        if let Self::Ref(id) = self {
            heap.inc_ref(*id);
            Self::Ref(*id)
        } else {
            self.clone_primitive()
        }
    }

    /// Releases the value, decrementing the refcount for heap handles.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// Truthiness: numbers are truthy iff non-zero, strings unless empty or
    /// case-insensitively "false", objects by their kind rule.
    #[must_use]
    pub fn as_bool(&self, heap: &Heap) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Char(c) => *c != '\0',
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
            Self::Null => false,
            Self::Ref(id) => heap.get(*id).as_bool(),
        }
    }

    // --- binary operators -------------------------------------------------
    //
    // Operands are taken by reference; the VM owns the popped values and
    // releases them after the operation, so these functions never consume
    // heap references.

    pub fn add(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_add(*b))),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 + b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a + *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a + b)),
            (Self::Char(a), Self::Char(b)) => {
                let mut s = String::with_capacity(2);
                s.push(*a);
                s.push(*b);
                Ok(Self::Str(s))
            }
            (Self::Str(a), Self::Str(b)) => Ok(Self::Str(format!("{a}{b}"))),
            (Self::Str(a), Self::Char(b)) => {
                let mut s = a.clone();
                s.push(*b);
                Ok(Self::Str(s))
            }
            (Self::Str(a), b) => Ok(Self::Str(format!("{a}{}", b.to_display_string(heap)))),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot add `{}` to `{}`",
                other.type_name(heap),
                self.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn subtract(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_sub(*b))),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 - b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a - *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a - b)),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot subtract `{}` from `{}`",
                other.type_name(heap),
                self.type_name(heap)
            ))
            .into()),
        }
    }

    /// Multiplication covers numeric promotion plus the repetition forms:
    /// `String * Int`, `Char * Int`, and `List * Int` (which allocates).
    pub fn multiply(&self, other: &Self, heap: &mut Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_mul(*b))),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 * b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a * *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a * b)),
            (Self::Char(c), Self::Int(n)) => {
                let count = usize::try_from(*n).unwrap_or(0);
                Ok(Self::Str(std::iter::repeat_n(*c, count).collect()))
            }
            (Self::Str(s), Self::Int(n)) => {
                let count = usize::try_from(*n).unwrap_or(0);
                Ok(Self::Str(s.repeat(count)))
            }
            (Self::Ref(id), Self::Int(n)) if heap.get(*id).as_list().is_some() => {
                let count = usize::try_from(*n).unwrap_or(0);
                let len = heap.get(*id).as_list().map_or(0, List::len);
                let mut items = Vec::with_capacity(len * count);
                for _ in 0..count {
                    for i in 0..len {
                        let item = heap
                            .get(*id)
                            .as_list()
                            .and_then(|l| l.get(i))
                            .map(|v| v.clone_with_heap(heap));
                        items.extend(item);
                    }
                }
                let new_id = heap.alloc(ObjectData::List(List::from_items(items)));
                Ok(Self::Ref(new_id))
            }
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot multiply `{}` by `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn divide(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(GraceError::invalid_operand("Cannot divide by zero").into())
                } else {
                    Ok(Self::Int(a.wrapping_div(*b)))
                }
            }
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 / b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a / *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a / b)),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot divide `{}` by `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn modulo(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(GraceError::invalid_operand("Cannot mod by zero").into())
                } else {
                    Ok(Self::Int(a.wrapping_rem(*b)))
                }
            }
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float((*a as f64) % b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a % *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a % b)),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot mod `{}` by `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into()),
        }
    }

    /// Exponentiation through `f64::powf`; two `Int` operands truncate back.
    #[expect(clippy::cast_possible_truncation, reason = "Int ** Int truncates by definition")]
    pub fn power(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int((*a as f64).powf(*b as f64) as i64)),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float((*a as f64).powf(*b))),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a.powf(*b as f64))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a.powf(*b))),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot exponentiate `{}` with `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into()),
        }
    }

    fn int_operands(&self, other: &Self, verb: &str, heap: &Heap) -> RunResult<(i64, i64)> {
        if let (Self::Int(a), Self::Int(b)) = (self, other) {
            Ok((*a, *b))
        } else {
            Err(GraceError::invalid_operand(format!(
                "Cannot {verb} `{}` by `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into())
        }
    }

    pub fn shift_left(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        let (a, b) = self.int_operands(other, "shift", heap)?;
        let amount = u32::try_from(b)
            .map_err(|_| GraceError::invalid_operand("Cannot shift by a negative amount"))?;
        Ok(Self::Int(a.wrapping_shl(amount)))
    }

    pub fn shift_right(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        let (a, b) = self.int_operands(other, "shift", heap)?;
        let amount = u32::try_from(b)
            .map_err(|_| GraceError::invalid_operand("Cannot shift by a negative amount"))?;
        Ok(Self::Int(a.wrapping_shr(amount)))
    }

    pub fn bitwise_and(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        let (a, b) = self.int_operands(other, "bitwise and", heap)?;
        Ok(Self::Int(a & b))
    }

    pub fn bitwise_or(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        let (a, b) = self.int_operands(other, "bitwise or", heap)?;
        Ok(Self::Int(a | b))
    }

    pub fn bitwise_xor(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        let (a, b) = self.int_operands(other, "bitwise xor", heap)?;
        Ok(Self::Int(a ^ b))
    }

    pub fn bitwise_not(&self, heap: &Heap) -> RunResult<Self> {
        if let Self::Int(a) = self {
            Ok(Self::Int(!a))
        } else {
            Err(GraceError::invalid_operand(format!(
                "Cannot bitwise not `{}`",
                self.type_name(heap)
            ))
            .into())
        }
    }

    pub fn negate(&self, heap: &Heap) -> RunResult<Self> {
        match self {
            Self::Int(a) => Ok(Self::Int(a.wrapping_neg())),
            Self::Float(a) => Ok(Self::Float(-a)),
            _ => Err(GraceError::invalid_type(format!(
                "Cannot negate `{}`",
                self.type_name(heap)
            ))
            .into()),
        }
    }

    // --- comparison -------------------------------------------------------

    /// `==`: never throws. Numbers widen, a `Char` equals the one-character
    /// `String`, objects compare by identity, anything else mixed is `false`.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(a), Self::Float(b)) => (*a as f64) == *b,
            (Self::Float(a), Self::Int(b)) => *a == (*b as f64),
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::Char(a), Self::Str(b)) | (Self::Str(b), Self::Char(a)) => {
                let mut chars = b.chars();
                chars.next() == Some(*a) && chars.next().is_none()
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// `<`: defined for mutually comparable numbers and for chars, throws
    /// `InvalidOperand` otherwise.
    pub fn less_than(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a < b),
            (Self::Int(a), Self::Float(b)) => Ok((*a as f64) < *b),
            (Self::Float(a), Self::Int(b)) => Ok(*a < (*b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(a < b),
            (Self::Char(a), Self::Char(b)) => Ok(a < b),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot compare `{}` with `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn less_equal(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a <= b),
            (Self::Int(a), Self::Float(b)) => Ok((*a as f64) <= *b),
            (Self::Float(a), Self::Int(b)) => Ok(*a <= (*b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(a <= b),
            (Self::Char(a), Self::Char(b)) => Ok(a <= b),
            _ => Err(GraceError::invalid_operand(format!(
                "Cannot compare `{}` with `{}`",
                self.type_name(heap),
                other.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn greater_than(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        other.less_than(self, heap)
    }

    pub fn greater_equal(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        other.less_equal(self, heap)
    }

    // --- conversions ------------------------------------------------------

    #[expect(clippy::cast_possible_truncation, reason = "Float -> Int truncates by definition")]
    pub fn to_int(&self, heap: &Heap) -> RunResult<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            Self::Float(f) => Ok(*f as i64),
            Self::Bool(b) => Ok(i64::from(*b)),
            Self::Char(c) => Ok(i64::from(u32::from(*c))),
            Self::Str(s) => s.trim().parse::<i64>().map_err(|err| {
                GraceError::invalid_cast(format!("Could not convert '{s}' to `Int`: {err}")).into()
            }),
            _ => Err(GraceError::invalid_cast(format!(
                "Cannot cast `{}` as `Int`",
                self.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn to_float(&self, heap: &Heap) -> RunResult<f64> {
        match self {
            Self::Int(i) => Ok(*i as f64),
            Self::Float(f) => Ok(*f),
            Self::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Self::Char(c) => Ok(f64::from(u32::from(*c))),
            Self::Str(s) => s.trim().parse::<f64>().map_err(|err| {
                GraceError::invalid_cast(format!("Could not convert '{s}' to `Float`: {err}")).into()
            }),
            _ => Err(GraceError::invalid_cast(format!(
                "Cannot cast `{}` as `Float`",
                self.type_name(heap)
            ))
            .into()),
        }
    }

    pub fn to_char(&self, heap: &Heap) -> RunResult<char> {
        match self {
            Self::Char(c) => Ok(*c),
            Self::Int(i) => u32::try_from(*i)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| {
                    GraceError::invalid_cast(format!("`{i}` is not a valid character code")).into()
                }),
            Self::Str(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(c),
                    _ => Err(GraceError::invalid_cast(format!(
                        "Cannot convert \"{s}\" to `Char`, string must be 1 character long"
                    ))
                    .into()),
                }
            }
            _ => Err(GraceError::invalid_cast(format!(
                "Cannot cast `{}` as `Char`",
                self.type_name(heap)
            ))
            .into()),
        }
    }

    // --- display ----------------------------------------------------------

    /// Display form, as printed by `print` and produced by `String(x)`.
    #[must_use]
    pub fn to_display_string(&self, heap: &Heap) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Char(c) => c.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
            Self::Null => "null".to_owned(),
            Self::Ref(id) => heap.display_object(*id),
        }
    }

    /// Element form used inside container displays: strings and chars carry
    /// their quotes so `["a", 'b']` round-trips visually.
    #[must_use]
    pub(crate) fn to_element_string(&self, heap: &Heap, on_path: &mut Vec<HeapId>) -> String {
        match self {
            Self::Str(s) => format!("\"{s}\""),
            Self::Char(c) => format!("'{c}'"),
            Self::Ref(id) => heap.display_object_guarded(*id, on_path),
            other => other.to_display_string(heap),
        }
    }

    /// Hash consistent with [`Value::equals`]: integral floats hash like the
    /// equal int and chars like one-character strings. `null` is unhashable.
    pub fn hash_value(&self) -> RunResult<u64> {
        match self {
            Self::Bool(b) => Ok(hashing::hash_bool(*b)),
            Self::Char(c) => Ok(hashing::hash_char(*c)),
            Self::Int(i) => Ok(hashing::hash_i64(*i)),
            Self::Float(f) => Ok(hashing::hash_f64(*f)),
            Self::Str(s) => Ok(hashing::hash_str(s)),
            Self::Ref(id) => Ok(hashing::hash_i64(id.index() as i64)),
            Self::Null => Err(GraceError::invalid_type("Cannot hash `null`").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn heap() -> Heap {
        Heap::new()
    }

    #[test]
    fn int_arithmetic_stays_int() {
        let heap = heap();
        let result = Value::Int(7).add(&Value::Int(35), &heap).unwrap();
        assert!(matches!(result, Value::Int(42)));
        let result = Value::Int(7).divide(&Value::Int(2), &heap).unwrap();
        assert!(matches!(result, Value::Int(3)));
    }

    #[test]
    fn int_widens_to_float() {
        let heap = heap();
        let result = Value::Int(1).add(&Value::Float(0.5), &heap).unwrap();
        assert!(matches!(result, Value::Float(f) if f == 1.5));
    }

    #[test]
    fn int_division_by_zero_is_an_error() {
        let heap = heap();
        assert!(Value::Int(1).divide(&Value::Int(0), &heap).is_err());
    }

    #[test]
    fn float_division_by_zero_is_infinite() {
        let heap = heap();
        let result = Value::Float(1.0).divide(&Value::Int(0), &heap).unwrap();
        assert!(matches!(result, Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn string_and_char_concatenation() {
        let heap = heap();
        let result = Value::Str("ab".into())
            .add(&Value::Char('c'), &heap)
            .unwrap();
        assert!(matches!(result, Value::Str(s) if s == "abc"));
        let result = Value::Char('a').add(&Value::Char('b'), &heap).unwrap();
        assert!(matches!(result, Value::Str(s) if s == "ab"));
    }

    #[test]
    fn string_repetition_clamps_at_zero() {
        let mut heap = Heap::new();
        let result = Value::Str("ab".into())
            .multiply(&Value::Int(-3), &mut heap)
            .unwrap();
        assert!(matches!(result, Value::Str(s) if s.is_empty()));
        let result = Value::Char('x').multiply(&Value::Int(3), &mut heap).unwrap();
        assert!(matches!(result, Value::Str(s) if s == "xxx"));
    }

    #[test]
    fn equality_never_throws_and_widens() {
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Char('a').equals(&Value::Str("a".into())));
        assert!(!Value::Int(1).equals(&Value::Str("1".into())));
        assert!(Value::Null.equals(&Value::Null));
        assert!(!Value::Null.equals(&Value::Int(0)));
    }

    #[test]
    fn comparison_requires_comparable_operands() {
        let heap = heap();
        assert!(Value::Int(1).less_than(&Value::Float(1.5), &heap).unwrap());
        assert!(Value::Char('a').less_than(&Value::Char('b'), &heap).unwrap());
        assert!(Value::Int(1).less_than(&Value::Str("2".into()), &heap).is_err());
    }

    #[test]
    fn truthiness_rules() {
        let heap = heap();
        assert!(Value::Int(-1).as_bool(&heap));
        assert!(!Value::Int(0).as_bool(&heap));
        assert!(!Value::Str(String::new()).as_bool(&heap));
        assert!(!Value::Str("FALSE".into()).as_bool(&heap));
        assert!(Value::Str("true".into()).as_bool(&heap));
        assert!(!Value::Null.as_bool(&heap));
    }

    #[test]
    fn display_forms() {
        let heap = heap();
        assert_eq!(Value::Float(2.5).to_display_string(&heap), "2.5");
        assert_eq!(Value::Int(2).to_display_string(&heap), "2");
        assert_eq!(Value::Null.to_display_string(&heap), "null");
        assert_eq!(Value::Bool(true).to_display_string(&heap), "true");
    }

    #[test]
    fn pow_of_ints_truncates() {
        let heap = heap();
        let result = Value::Int(2).power(&Value::Int(10), &heap).unwrap();
        assert!(matches!(result, Value::Int(1024)));
    }
}
