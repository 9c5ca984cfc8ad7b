//! Native leaf functions.
//!
//! Registered in a fixed-order table; the compiler resolves `__NATIVE_*`
//! names to table indices and checks arity, so the VM's `NativeCall` is a
//! straight indexed dispatch. Natives receive the heap and the print writer
//! explicitly and report failures through the ordinary error channel;
//! `__NATIVE_SYSTEM_EXIT` uses the non-catchable `Exit` channel.

use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::{ExcKind, GraceError, RunError, RunResult},
    heap::{Heap, ObjectData},
    io::PrintWriter,
    types::{List, dict_contains_key, dict_get, dict_insert, dict_remove},
    value::Value,
};

pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub writer: &'a mut dyn PrintWriter,
}

pub type NativeFn = for<'a> fn(&mut NativeContext<'a>, Vec<Value>) -> RunResult<Value>;

pub struct NativeFunction {
    pub name: &'static str,
    pub arity: usize,
    pub func: NativeFn,
}

/// The registry, in table order. `NativeCall` operands index into this.
pub static NATIVES: &[NativeFunction] = &[
    // maths
    NativeFunction { name: "__NATIVE_SQRT_FLOAT", arity: 1, func: sqrt_float },
    NativeFunction { name: "__NATIVE_SQRT_INT", arity: 1, func: sqrt_int },
    // time
    NativeFunction { name: "__NATIVE_TIME_H", arity: 0, func: time_hours },
    NativeFunction { name: "__NATIVE_TIME_M", arity: 0, func: time_minutes },
    NativeFunction { name: "__NATIVE_TIME_S", arity: 0, func: time_seconds },
    NativeFunction { name: "__NATIVE_TIME_MS", arity: 0, func: time_millis },
    NativeFunction { name: "__NATIVE_TIME_US", arity: 0, func: time_micros },
    NativeFunction { name: "__NATIVE_TIME_NS", arity: 0, func: time_nanos },
    NativeFunction { name: "__NATIVE_TIME_SLEEP", arity: 1, func: sleep },
    // lists
    NativeFunction { name: "__NATIVE_APPEND_LIST", arity: 2, func: list_append },
    NativeFunction { name: "__NATIVE_SET_LIST_AT_INDEX", arity: 3, func: list_set_at_index },
    NativeFunction { name: "__NATIVE_GET_LIST_AT_INDEX", arity: 2, func: list_get_at_index },
    NativeFunction { name: "__NATIVE_REMOVE_LIST_AT_INDEX", arity: 2, func: list_remove_at_index },
    NativeFunction { name: "__NATIVE_LIST_LENGTH", arity: 1, func: list_length },
    // dictionaries
    NativeFunction { name: "__NATIVE_DICTIONARY_INSERT", arity: 3, func: dictionary_insert },
    NativeFunction { name: "__NATIVE_DICTIONARY_GET", arity: 2, func: dictionary_get },
    NativeFunction {
        name: "__NATIVE_DICTIONARY_CONTAINS_KEY",
        arity: 2,
        func: dictionary_contains_key,
    },
    NativeFunction { name: "__NATIVE_DICTIONARY_REMOVE", arity: 2, func: dictionary_remove },
    // files
    NativeFunction { name: "__NATIVE_FILE_WRITE", arity: 2, func: file_write },
    // console io
    NativeFunction { name: "__NATIVE_FLUSH_STDOUT", arity: 0, func: flush_stdout },
    NativeFunction { name: "__NATIVE_FLUSH_STDERR", arity: 0, func: flush_stderr },
    // system
    NativeFunction { name: "__NATIVE_SYSTEM_EXIT", arity: 1, func: system_exit },
    NativeFunction { name: "__NATIVE_SYSTEM_RUN", arity: 1, func: system_run },
];

/// Compile-time lookup: `(index, arity)` for a native name.
#[must_use]
pub fn lookup(name: &str) -> Option<(usize, usize)> {
    NATIVES
        .iter()
        .position(|native| native.name == name)
        .map(|index| (index, NATIVES[index].arity))
}

fn drop_args(args: Vec<Value>, heap: &mut Heap) {
    for arg in args {
        arg.drop_with_heap(heap);
    }
}

fn expect_int(value: &Value, what: &str) -> RunResult<i64> {
    if let Value::Int(i) = value {
        Ok(*i)
    } else {
        Err(GraceError::invalid_type(format!("{what} must be an `Int`")).into())
    }
}

fn sqrt_float(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = match args.first() {
        Some(Value::Float(f)) => Ok(Value::Float(f.sqrt())),
        Some(Value::Int(i)) => Ok(Value::Float((*i as f64).sqrt())),
        _ => Err(GraceError::invalid_type("expected a number for square root").into()),
    };
    drop_args(args, ctx.heap);
    result
}

fn sqrt_int(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    #[expect(clippy::cast_possible_truncation, reason = "integer square root truncates")]
    let result = match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int((*i as f64).sqrt() as i64)),
        Some(Value::Float(f)) => Ok(Value::Int(f.sqrt() as i64)),
        _ => Err(GraceError::invalid_type("expected a number for square root").into()),
    };
    drop_args(args, ctx.heap);
    result
}

fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

#[expect(clippy::cast_possible_wrap, reason = "durations fit i64 for any realistic clock")]
fn time_hours(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    Ok(Value::Int((since_epoch().as_secs() / 3600) as i64))
}

#[expect(clippy::cast_possible_wrap, reason = "durations fit i64 for any realistic clock")]
fn time_minutes(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    Ok(Value::Int((since_epoch().as_secs() / 60) as i64))
}

#[expect(clippy::cast_possible_wrap, reason = "durations fit i64 for any realistic clock")]
fn time_seconds(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    Ok(Value::Int(since_epoch().as_secs() as i64))
}

#[expect(clippy::cast_possible_truncation, reason = "durations fit i64 for any realistic clock")]
fn time_millis(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    Ok(Value::Int(since_epoch().as_millis() as i64))
}

#[expect(clippy::cast_possible_truncation, reason = "durations fit i64 for any realistic clock")]
fn time_micros(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    Ok(Value::Int(since_epoch().as_micros() as i64))
}

#[expect(clippy::cast_possible_truncation, reason = "nanosecond overflow is tolerated")]
fn time_nanos(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    Ok(Value::Int(since_epoch().as_nanos() as i64))
}

fn sleep(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let millis = expect_int(&args[0], "sleep duration");
    drop_args(args, ctx.heap);
    let millis = millis?;
    if millis > 0 {
        std::thread::sleep(std::time::Duration::from_millis(millis.unsigned_abs()));
    }
    Ok(Value::Null)
}

fn list_id(value: &Value, heap: &Heap) -> RunResult<crate::heap::HeapId> {
    if let Value::Ref(id) = value
        && heap.get(*id).as_list().is_some()
    {
        Ok(*id)
    } else {
        Err(GraceError::invalid_type(format!(
            "expected a `List` but got `{}`",
            value.type_name(heap)
        ))
        .into())
    }
}

fn list_append(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let mut args = args.into_iter();
    let list = args.next().expect("arity-checked call");
    let value = args.next().expect("arity-checked call");

    let id = match list_id(&list, ctx.heap) {
        Ok(id) => id,
        Err(err) => {
            list.drop_with_heap(ctx.heap);
            value.drop_with_heap(ctx.heap);
            return Err(err);
        }
    };
    ctx.heap
        .get_mut(id)
        .as_list_mut()
        .expect("checked above")
        .push(value);
    ctx.heap.invalidate_iterators(id);
    list.drop_with_heap(ctx.heap);
    Ok(Value::Null)
}

fn list_set_at_index(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let mut args = args.into_iter();
    let list = args.next().expect("arity-checked call");
    let index = args.next().expect("arity-checked call");
    let value = args.next().expect("arity-checked call");

    let result = (|| {
        let id = list_id(&list, ctx.heap)?;
        let i = expect_int(&index, "list index")?;
        let len = ctx.heap.get(id).as_list().expect("checked above").len();
        let slot = usize::try_from(i)
            .ok()
            .filter(|slot| *slot < len)
            .ok_or_else(|| {
                GraceError::index_out_of_range(format!(
                    "index {i} out of range for `List` of length {len}"
                ))
            })?;
        Ok(slot)
    })();

    match result {
        Ok(slot) => {
            let id = list_id(&list, ctx.heap).expect("validated above");
            let old = ctx
                .heap
                .get_mut(id)
                .as_list_mut()
                .expect("checked above")
                .set(slot, value)
                .expect("bounds checked above");
            old.drop_with_heap(ctx.heap);
            list.drop_with_heap(ctx.heap);
            index.drop_with_heap(ctx.heap);
            Ok(Value::Null)
        }
        Err(err) => {
            list.drop_with_heap(ctx.heap);
            index.drop_with_heap(ctx.heap);
            value.drop_with_heap(ctx.heap);
            Err(err)
        }
    }
}

fn list_get_at_index(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = (|| {
        let id = list_id(&args[0], ctx.heap)?;
        let i = expect_int(&args[1], "list index")?;
        let list = ctx.heap.get(id).as_list().expect("checked above");
        let element = usize::try_from(i).ok().and_then(|slot| list.get(slot)).ok_or_else(|| {
            GraceError::index_out_of_range(format!(
                "index {i} out of range for `List` of length {len}",
                len = list.len()
            ))
        })?;
        Ok(element.clone_with_heap(ctx.heap))
    })();
    drop_args(args, ctx.heap);
    result
}

/// Removes and returns the element at the given index. Structural mutation:
/// outstanding iterators are invalidated.
fn list_remove_at_index(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = (|| {
        let id = list_id(&args[0], ctx.heap)?;
        let i = expect_int(&args[1], "list index")?;
        let len = ctx.heap.get(id).as_list().expect("checked above").len();
        if len == 0 {
            return Err(GraceError::new(
                ExcKind::InvalidCollectionOperation,
                "cannot remove from an empty `List`",
            )
            .into());
        }
        let slot = usize::try_from(i).ok().filter(|slot| *slot < len).ok_or_else(|| {
            GraceError::index_out_of_range(format!(
                "index {i} out of range for `List` of length {len}"
            ))
        })?;
        let removed = ctx
            .heap
            .get_mut(id)
            .as_list_mut()
            .expect("checked above")
            .remove(slot)
            .expect("bounds checked above");
        ctx.heap.invalidate_iterators(id);
        Ok(removed)
    })();
    drop_args(args, ctx.heap);
    result
}

#[expect(clippy::cast_possible_wrap, reason = "list lengths fit i64")]
fn list_length(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = list_id(&args[0], ctx.heap)
        .map(|id| Value::Int(ctx.heap.get(id).as_list().expect("checked above").len() as i64));
    drop_args(args, ctx.heap);
    result
}

fn dict_id(value: &Value, heap: &Heap) -> RunResult<crate::heap::HeapId> {
    if let Value::Ref(id) = value
        && heap.get(*id).as_dict().is_some()
    {
        Ok(*id)
    } else {
        Err(GraceError::invalid_type(format!(
            "expected a `Dict` but got `{}`",
            value.type_name(heap)
        ))
        .into())
    }
}

fn dictionary_insert(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let mut args = args.into_iter();
    let dict = args.next().expect("arity-checked call");
    let key = args.next().expect("arity-checked call");
    let value = args.next().expect("arity-checked call");

    match dict_id(&dict, ctx.heap) {
        Ok(id) => {
            let result = dict_insert(ctx.heap, id, key, value);
            dict.drop_with_heap(ctx.heap);
            result.map(|()| Value::Null)
        }
        Err(err) => {
            dict.drop_with_heap(ctx.heap);
            key.drop_with_heap(ctx.heap);
            value.drop_with_heap(ctx.heap);
            Err(err)
        }
    }
}

fn dictionary_get(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = match dict_id(&args[0], ctx.heap) {
        Ok(id) => dict_get(ctx.heap, id, &args[1]),
        Err(err) => Err(err),
    };
    drop_args(args, ctx.heap);
    result
}

fn dictionary_contains_key(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = match dict_id(&args[0], ctx.heap) {
        Ok(id) => dict_contains_key(ctx.heap, id, &args[1]).map(Value::Bool),
        Err(err) => Err(err),
    };
    drop_args(args, ctx.heap);
    result
}

/// Removes a key if present, returning whether anything was removed.
fn dictionary_remove(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let result = match dict_id(&args[0], ctx.heap) {
        Ok(id) => dict_remove(ctx.heap, id, &args[1]).map(Value::Bool),
        Err(err) => Err(err),
    };
    drop_args(args, ctx.heap);
    result
}

fn file_write(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let path = args[0].to_display_string(ctx.heap);
    let text = args[1].to_display_string(ctx.heap);
    drop_args(args, ctx.heap);
    std::fs::write(&path, text).map_err(|err| {
        RunError::from(GraceError::new(
            ExcKind::FileWriteFailed,
            format!("failed to write to {path}: {err}"),
        ))
    })?;
    Ok(Value::Null)
}

fn flush_stdout(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    let _ = std::io::stdout().flush();
    Ok(Value::Null)
}

fn flush_stderr(_: &mut NativeContext<'_>, _: Vec<Value>) -> RunResult<Value> {
    let _ = std::io::stderr().flush();
    Ok(Value::Null)
}

fn system_exit(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let code = expect_int(&args[0], "exit code");
    drop_args(args, ctx.heap);
    Err(RunError::Exit(code?))
}

fn system_run(ctx: &mut NativeContext<'_>, args: Vec<Value>) -> RunResult<Value> {
    let command = args[0].to_display_string(ctx.heap);
    drop_args(args, ctx.heap);
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .map_err(|err| {
            RunError::from(GraceError::new(
                ExcKind::InvalidArgument,
                format!("failed to run `{command}`: {err}"),
            ))
        })?;
    Ok(Value::Int(i64::from(status.code().unwrap_or(-1))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_natives() {
        let (index, arity) = lookup("__NATIVE_APPEND_LIST").unwrap();
        assert_eq!(NATIVES[index].name, "__NATIVE_APPEND_LIST");
        assert_eq!(arity, 2);
        assert!(lookup("__NATIVE_NOPE").is_none());
    }

    #[test]
    fn append_and_length_round_trip() {
        let mut heap = Heap::new();
        let mut writer = crate::io::NoPrint;
        let list = heap.alloc(ObjectData::List(List::default()));
        heap.inc_ref(list);

        let mut ctx = NativeContext {
            heap: &mut heap,
            writer: &mut writer,
        };
        list_append(&mut ctx, vec![Value::Ref(list), Value::Int(7)]).unwrap();
        heap.inc_ref(list);
        let len = {
            let mut ctx = NativeContext {
                heap: &mut heap,
                writer: &mut writer,
            };
            list_length(&mut ctx, vec![Value::Ref(list)]).unwrap()
        };
        assert!(matches!(len, Value::Int(1)));
        heap.dec_ref(list);
        assert_eq!(heap.live_objects(), 0);
    }
}
