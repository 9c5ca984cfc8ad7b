//! Lazy arithmetic progression `[min..max by increment]`.
//!
//! Direction comes from the sign of the increment; iteration stops strictly
//! before `max`. No elements are materialised; the iterator's cursor holds
//! the current number directly.

use super::IterRegistry;
use crate::{
    error::{ExcKind, GraceError, RunResult},
    value::Value,
};

#[derive(Debug)]
pub struct Range {
    min: f64,
    max: f64,
    increment: f64,
    /// True when all three operands were `Int`s, so iteration yields `Int`s.
    integral: bool,
    pub(crate) iterators: IterRegistry,
}

impl Range {
    /// Validates the three operands: all numbers, non-zero increment.
    pub fn new(min: &Value, max: &Value, increment: &Value) -> RunResult<Self> {
        let numeric = |value: &Value, role: &str| -> RunResult<f64> {
            match value {
                Value::Int(i) => Ok(*i as f64),
                Value::Float(f) => Ok(*f),
                other => Err(GraceError::invalid_type(format!(
                    "All values in range expression must be numbers, got `{}` for {role}",
                    other.type_of()
                ))
                .into()),
            }
        };

        let min_val = numeric(min, "min")?;
        let max_val = numeric(max, "max")?;
        let inc_val = numeric(increment, "increment")?;
        if inc_val == 0.0 {
            return Err(GraceError::new(
                ExcKind::InvalidArgument,
                "Range increment must not be zero",
            )
            .into());
        }

        let integral = matches!(
            (min, max, increment),
            (Value::Int(_), Value::Int(_), Value::Int(_))
        );

        Ok(Self {
            min: min_val,
            max: max_val,
            increment: inc_val,
            integral,
            iterators: IterRegistry::default(),
        })
    }

    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    #[must_use]
    pub fn increment(&self) -> f64 {
        self.increment
    }

    #[must_use]
    pub fn is_integral(&self) -> bool {
        self.integral
    }

    /// Whether the cursor value is still strictly before `max` in the
    /// direction of travel.
    #[must_use]
    pub fn in_bounds(&self, current: f64) -> bool {
        if self.increment > 0.0 {
            current < self.max
        } else {
            current > self.max
        }
    }

    /// Truthy iff iteration would yield at least one element.
    #[must_use]
    pub fn yields_any(&self) -> bool {
        self.in_bounds(self.min)
    }

    #[must_use]
    pub fn display(&self) -> String {
        #[expect(clippy::cast_possible_truncation, reason = "integral ranges came from i64s")]
        let number = |value: f64| {
            if self.integral {
                (value as i64).to_string()
            } else {
                value.to_string()
            }
        };
        format!(
            "[{}..{} by {}]",
            number(self.min),
            number(self.max),
            number(self.increment)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_comes_from_increment_sign() {
        let up = Range::new(&Value::Int(0), &Value::Int(5), &Value::Int(1)).unwrap();
        assert!(up.yields_any());
        assert!(!up.in_bounds(5.0));

        let down = Range::new(&Value::Int(5), &Value::Int(0), &Value::Int(-1)).unwrap();
        assert!(down.yields_any());
        assert!(!down.in_bounds(0.0));

        let empty = Range::new(&Value::Int(5), &Value::Int(0), &Value::Int(1)).unwrap();
        assert!(!empty.yields_any());
    }

    #[test]
    fn zero_increment_is_rejected() {
        assert!(Range::new(&Value::Int(0), &Value::Int(5), &Value::Int(0)).is_err());
    }

    #[test]
    fn non_numbers_are_rejected() {
        assert!(Range::new(&Value::Str("a".into()), &Value::Int(5), &Value::Int(1)).is_err());
    }

    #[test]
    fn display_matches_literal_form() {
        let range = Range::new(&Value::Int(0), &Value::Int(10), &Value::Int(2)).unwrap();
        assert_eq!(range.display(), "[0..10 by 2]");
    }
}
