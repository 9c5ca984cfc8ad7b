//! The virtual machine: a stack interpreter over the linearised op and
//! constant streams.
//!
//! Frames are flattened: all live locals sit in one vector with a base-offset
//! stack, return positions are pushed onto the value stack as plain ints, and
//! jump operands are per-function indices rebased through the offsets of the
//! function currently executing.

pub mod natives;

use smallvec::SmallVec;

use crate::{
    bytecode::{Op, Program},
    error::{ExcKind, GraceError, RunError, RunResult},
    hashing::name_hash,
    heap::{Heap, HeapId, ObjectData},
    io::PrintWriter,
    types::{
        Dict, ExceptionObj, Instance, KeyValuePair, List, Range, Set, dict_get, dict_insert,
        iter_advance, iter_current, iter_current_pair, iter_done, iter_new, set_add,
    },
    value::{Type, Value},
};

use natives::{NATIVES, NativeContext};

/// Outcome of running a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    RuntimeOk,
    RuntimeError,
    /// `__NATIVE_SYSTEM_EXIT(n)` ended execution with code `n`.
    Exited(i64),
}

/// How many call frames a trace shows unless `GRACE_SHOW_FULL_CALLSTACK` is
/// set.
const CALLSTACK_TRACE_LIMIT: usize = 15;

pub struct Vm {
    program: Program,
    heap: Heap,
}

impl Vm {
    #[must_use]
    pub fn new(program: Program) -> Self {
        Self {
            program,
            heap: Heap::new(),
        }
    }

    /// Runs `main` with the given command-line arguments.
    pub fn run(&mut self, args: &[String], writer: &mut dyn PrintWriter) -> InterpretResult {
        let mut machine = Machine::new(&self.program, &mut self.heap, writer);
        machine.run(args)
    }

    /// Live heap objects; zero after a completed run.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }
}

/// Diagnostic record of one active call.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    caller_hash: u64,
    callee_hash: u64,
    call_line: usize,
    caller_file_hash: u64,
    callee_file_hash: u64,
}

/// Snapshot taken by `EnterTry`, restored when an exception unwinds to the
/// handler.
#[derive(Debug, Clone, Copy)]
struct TryState {
    value_stack_len: usize,
    locals_len: usize,
    call_stack_len: usize,
    op_offsets_len: usize,
    locals_offsets_len: usize,
    held_iterators_len: usize,
    namespace_len: usize,
    file_stack_len: usize,
    handler_const_idx: usize,
    handler_op_idx: usize,
}

enum Flow {
    Continue,
    Exit,
}

struct Machine<'a> {
    program: &'a Program,
    heap: &'a mut Heap,
    writer: &'a mut dyn PrintWriter,
    value_stack: Vec<Value>,
    locals: Vec<Value>,
    locals_offsets: Vec<usize>,
    op_const_offsets: Vec<(usize, usize)>,
    call_stack: Vec<CallFrame>,
    held_iterators: Vec<HeapId>,
    namespace_parts: SmallVec<[(String, u64); 4]>,
    file_hash_stack: Vec<u64>,
    try_states: Vec<TryState>,
    op_cursor: usize,
    const_cursor: usize,
    current_fn_hash: u64,
}

impl<'a> Machine<'a> {
    fn new(program: &'a Program, heap: &'a mut Heap, writer: &'a mut dyn PrintWriter) -> Self {
        Self {
            program,
            heap,
            writer,
            value_stack: Vec::with_capacity(16),
            locals: Vec::with_capacity(16),
            locals_offsets: Vec::new(),
            op_const_offsets: Vec::new(),
            call_stack: Vec::new(),
            held_iterators: Vec::new(),
            namespace_parts: SmallVec::new(),
            file_hash_stack: Vec::new(),
            try_states: Vec::new(),
            op_cursor: 0,
            const_cursor: 0,
            current_fn_hash: 0,
        }
    }

    fn run(&mut self, args: &[String]) -> InterpretResult {
        let entry_file = self.program.entry_file_hash;
        let main_hash = name_hash("main");

        self.locals_offsets.push(0);
        self.op_const_offsets.push((0, 0));
        self.file_hash_stack.push(entry_file);
        self.current_fn_hash = main_hash;
        self.call_stack.push(CallFrame {
            caller_hash: main_hash,
            callee_hash: main_hash,
            call_line: 1,
            caller_file_hash: entry_file,
            callee_file_hash: entry_file,
        });

        // The command-line list occupies main's first local slot whether it
        // was declared as a parameter or synthesised.
        let arg_values: Vec<Value> = args.iter().map(|arg| Value::Str(arg.clone())).collect();
        let args_id = self.heap.alloc(ObjectData::List(List::from_items(arg_values)));
        self.locals.push(Value::Ref(args_id));

        loop {
            let op_line = self.program.ops[self.op_cursor];
            self.op_cursor += 1;

            match self.execute(op_line.op, op_line.line) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => {
                    self.release_everything();
                    return InterpretResult::RuntimeOk;
                }
                Err(RunError::Exit(code)) => {
                    self.release_everything();
                    return InterpretResult::Exited(code);
                }
                Err(RunError::Error(err)) => {
                    if !self.unwind_to_handler(&err) {
                        self.report_runtime_error(&err, op_line.line);
                        self.release_everything();
                        return InterpretResult::RuntimeError;
                    }
                }
            }
        }
    }

    // --- stack and operand helpers ---------------------------------------

    fn push(&mut self, value: Value) {
        self.value_stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.value_stack.pop().expect("value stack underflow")
    }

    fn pop_two(&mut self) -> (Value, Value) {
        let second = self.pop();
        let first = self.pop();
        (first, second)
    }

    fn next_const(&mut self) -> &Value {
        let value = &self.program.constants[self.const_cursor];
        self.const_cursor += 1;
        value
    }

    fn next_const_int(&mut self) -> i64 {
        match self.next_const() {
            Value::Int(i) => *i,
            other => panic!("expected Int constant, got {other:?}"),
        }
    }

    #[expect(clippy::cast_sign_loss, reason = "hashes round-trip through Int constants")]
    fn next_const_hash(&mut self) -> u64 {
        self.next_const_int() as u64
    }

    #[expect(clippy::cast_sign_loss, reason = "emitted indices are non-negative")]
    fn next_const_usize(&mut self) -> usize {
        self.next_const_int() as usize
    }

    fn next_const_bool(&mut self) -> bool {
        match self.next_const() {
            Value::Bool(b) => *b,
            other => panic!("expected Bool constant, got {other:?}"),
        }
    }

    fn next_const_str(&mut self) -> String {
        match self.next_const() {
            Value::Str(s) => s.clone(),
            other => panic!("expected String constant, got {other:?}"),
        }
    }

    fn locals_base(&self) -> usize {
        *self.locals_offsets.last().expect("no active frame")
    }

    fn local_slot(&mut self) -> usize {
        let slot = self.next_const_usize();
        slot + self.locals_base()
    }

    fn current_file_hash(&self) -> u64 {
        *self.file_hash_stack.last().expect("no executing file")
    }

    fn drop_value(&mut self, value: Value) {
        value.drop_with_heap(self.heap);
    }

    fn truncate_value_stack(&mut self, len: usize) {
        while self.value_stack.len() > len {
            let value = self.pop();
            self.drop_value(value);
        }
    }

    fn truncate_locals(&mut self, len: usize) {
        while self.locals.len() > len {
            let value = self.locals.pop().expect("len checked");
            self.drop_value(value);
        }
    }

    fn truncate_held_iterators(&mut self, len: usize) {
        while self.held_iterators.len() > len {
            let iter_id = self.held_iterators.pop().expect("len checked");
            self.heap.dec_ref(iter_id);
        }
    }

    fn release_everything(&mut self) {
        self.truncate_value_stack(0);
        self.truncate_locals(0);
        self.truncate_held_iterators(0);
    }

    fn jump_to(&mut self, const_idx: usize, op_idx: usize) {
        let (op_start, const_start) = *self.op_const_offsets.last().expect("no active frame");
        self.op_cursor = op_idx + op_start;
        self.const_cursor = const_idx + const_start;
    }

    // --- dispatch ---------------------------------------------------------

    fn execute(&mut self, op: Op, line: usize) -> RunResult<Flow> {
        match op {
            Op::Add => self.binary_op(Value::add)?,
            Op::Subtract => self.binary_op(Value::subtract)?,
            Op::Divide => self.binary_op(Value::divide)?,
            Op::Mod => self.binary_op(Value::modulo)?,
            Op::Pow => self.binary_op(Value::power)?,
            Op::ShiftLeft => self.binary_op(Value::shift_left)?,
            Op::ShiftRight => self.binary_op(Value::shift_right)?,
            Op::BitwiseAnd => self.binary_op(Value::bitwise_and)?,
            Op::BitwiseOr => self.binary_op(Value::bitwise_or)?,
            Op::BitwiseXOr => self.binary_op(Value::bitwise_xor)?,
            Op::Multiply => {
                let (a, b) = self.pop_two();
                let result = a.multiply(&b, self.heap);
                self.drop_value(a);
                self.drop_value(b);
                self.push(result?);
            }
            Op::Negate => {
                let value = self.pop();
                let result = value.negate(self.heap);
                self.drop_value(value);
                self.push(result?);
            }
            Op::BitwiseNot => {
                let value = self.pop();
                let result = value.bitwise_not(self.heap);
                self.drop_value(value);
                self.push(result?);
            }
            Op::Not => {
                let value = self.pop();
                let result = !value.as_bool(self.heap);
                self.drop_value(value);
                self.push(Value::Bool(result));
            }
            Op::And => {
                let (a, b) = self.pop_two();
                let result = a.as_bool(self.heap) && b.as_bool(self.heap);
                self.drop_value(a);
                self.drop_value(b);
                self.push(Value::Bool(result));
            }
            Op::Or => {
                let (a, b) = self.pop_two();
                let result = a.as_bool(self.heap) || b.as_bool(self.heap);
                self.drop_value(a);
                self.drop_value(b);
                self.push(Value::Bool(result));
            }
            Op::Equal => {
                let (a, b) = self.pop_two();
                let result = a.equals(&b);
                self.drop_value(a);
                self.drop_value(b);
                self.push(Value::Bool(result));
            }
            Op::NotEqual => {
                let (a, b) = self.pop_two();
                let result = !a.equals(&b);
                self.drop_value(a);
                self.drop_value(b);
                self.push(Value::Bool(result));
            }
            Op::Less => self.comparison_op(Value::less_than)?,
            Op::LessEqual => self.comparison_op(Value::less_equal)?,
            Op::Greater => self.comparison_op(Value::greater_than)?,
            Op::GreaterEqual => self.comparison_op(Value::greater_equal)?,

            Op::AddAssign => self.compound_assign(Value::add)?,
            Op::SubtractAssign => self.compound_assign(Value::subtract)?,
            Op::DivideAssign => self.compound_assign(Value::divide)?,
            Op::ModAssign => self.compound_assign(Value::modulo)?,
            Op::PowAssign => self.compound_assign(Value::power)?,
            Op::ShiftLeftAssign => self.compound_assign(Value::shift_left)?,
            Op::ShiftRightAssign => self.compound_assign(Value::shift_right)?,
            Op::BitwiseAndAssign => self.compound_assign(Value::bitwise_and)?,
            Op::BitwiseOrAssign => self.compound_assign(Value::bitwise_or)?,
            Op::BitwiseXOrAssign => self.compound_assign(Value::bitwise_xor)?,
            Op::MultiplyAssign => {
                let rhs = self.pop();
                let slot = self.local_slot();
                let result = self.locals[slot].multiply(&rhs, self.heap);
                self.drop_value(rhs);
                let new_value = result?;
                let old = std::mem::replace(&mut self.locals[slot], new_value);
                self.drop_value(old);
            }

            Op::LoadConstant => {
                let value = self.next_const().clone_primitive();
                self.push(value);
            }
            Op::LoadLocal => {
                let slot = self.local_slot();
                let value = self.locals[slot].clone_with_heap(self.heap);
                self.push(value);
            }
            Op::AssignLocal => {
                let value = self.pop();
                let slot = self.local_slot();
                let old = std::mem::replace(&mut self.locals[slot], value);
                self.drop_value(old);
            }
            Op::DeclareLocal => {
                self.locals.push(Value::Null);
            }
            Op::Pop => {
                let value = self.pop();
                self.drop_value(value);
            }
            Op::PopLocal => {
                let value = self.locals.pop().expect("locals underflow");
                self.drop_value(value);
            }
            Op::PopLocals => {
                let target = self.next_const_usize() + self.locals_base();
                self.truncate_locals(target);
            }

            Op::Print => self.print_value(false, false),
            Op::PrintLn => self.print_value(false, true),
            Op::PrintTab => self.writer.stdout_write("\t"),
            Op::PrintEmptyLine => self.writer.stdout_write("\n"),
            Op::EPrint => self.print_value(true, false),
            Op::EPrintLn => self.print_value(true, true),
            Op::EPrintTab => self.writer.stderr_write("\t"),
            Op::EPrintEmptyLine => self.writer.stderr_write("\n"),

            Op::Call => self.call(line)?,
            Op::NativeCall => {
                let index = self.next_const_usize();
                let num_args = self.next_const_usize();
                let native = &NATIVES[index];
                if num_args != native.arity {
                    return Err(GraceError::new(
                        ExcKind::IncorrectArgCount,
                        format!(
                            "Incorrect number of arguments given to function '{}', expected {} \
                             but got {num_args}",
                            native.name, native.arity
                        ),
                    )
                    .into());
                }
                let mut call_args = Vec::with_capacity(num_args);
                for _ in 0..num_args {
                    call_args.push(self.pop());
                }
                call_args.reverse();
                let mut ctx = NativeContext {
                    heap: &mut *self.heap,
                    writer: &mut *self.writer,
                };
                let result = (native.func)(&mut ctx, call_args)?;
                self.push(result);
            }
            Op::MemberCall => self.member_call(line)?,
            Op::Return => {
                let return_value = self.pop();

                let frame = self.call_stack.pop().expect("call stack underflow");
                self.current_fn_hash = frame.caller_hash;
                self.file_hash_stack.pop();

                // An early return out of a `try` leaves snapshots for frames
                // that no longer exist; they must not catch anything later.
                while self
                    .try_states
                    .last()
                    .is_some_and(|state| state.call_stack_len > self.call_stack.len())
                {
                    self.try_states.pop();
                }

                let held_size = match self.pop() {
                    Value::Int(i) => usize::try_from(i).expect("frame marker corrupt"),
                    other => panic!("expected frame marker, got {other:?}"),
                };
                let const_return = match self.pop() {
                    Value::Int(i) => usize::try_from(i).expect("frame marker corrupt"),
                    other => panic!("expected frame marker, got {other:?}"),
                };
                let op_return = match self.pop() {
                    Value::Int(i) => usize::try_from(i).expect("frame marker corrupt"),
                    other => panic!("expected frame marker, got {other:?}"),
                };

                self.truncate_held_iterators(held_size);
                self.op_cursor = op_return;
                self.const_cursor = const_return;

                let frame_base = self.locals_offsets.pop().expect("locals offsets underflow");
                self.truncate_locals(frame_base);
                self.op_const_offsets.pop();

                self.push(return_value);
            }
            Op::Exit => return Ok(Flow::Exit),

            Op::StartNewNamespace => {
                self.namespace_parts.clear();
            }
            Op::AppendNamespace => {
                let text = self.next_const_str();
                let hash = self.next_const_hash();
                self.namespace_parts.push((text, hash));
            }

            Op::Jump => {
                let const_idx = self.next_const_usize();
                let op_idx = self.next_const_usize();
                self.jump_to(const_idx, op_idx);
            }
            Op::JumpIfFalse => {
                let const_idx = self.next_const_usize();
                let op_idx = self.next_const_usize();
                let condition = self.pop();
                let truthy = condition.as_bool(self.heap);
                self.drop_value(condition);
                if !truthy {
                    self.jump_to(const_idx, op_idx);
                }
            }
            Op::JumpIfTrue => {
                let const_idx = self.next_const_usize();
                let op_idx = self.next_const_usize();
                let condition = self.pop();
                let truthy = condition.as_bool(self.heap);
                self.drop_value(condition);
                if truthy {
                    self.jump_to(const_idx, op_idx);
                }
            }

            Op::AssignIteratorBegin => {
                let two_iterators = self.next_const_bool();
                let first_slot = self.next_const_usize();
                let second_slot = self.next_const_usize();
                let iterable = self.pop();
                let iter_id = iter_new(self.heap, iterable)?;
                self.held_iterators.push(iter_id);
                self.seed_iterator_vars(iter_id, two_iterators, first_slot, second_slot)?;
            }
            Op::CheckIteratorEnd => {
                let iter_id = *self.held_iterators.last().expect("no held iterator");
                let done = iter_done(self.heap, iter_id);
                self.push(Value::Bool(!done));
            }
            Op::IncrementIterator => {
                let two_iterators = self.next_const_bool();
                let first_slot = self.next_const_usize();
                let second_slot = self.next_const_usize();
                let iter_id = *self.held_iterators.last().expect("no held iterator");
                iter_advance(self.heap, iter_id)?;
                self.seed_iterator_vars(iter_id, two_iterators, first_slot, second_slot)?;
            }
            Op::DestroyHeldIterator => {
                let iter_id = self.held_iterators.pop().expect("no held iterator");
                self.heap.dec_ref(iter_id);
            }

            Op::CreateList => {
                let count = self.next_const_usize();
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop());
                }
                items.reverse();
                let id = self.heap.alloc(ObjectData::List(List::from_items(items)));
                self.push(Value::Ref(id));
            }
            Op::CreateListFromCast => self.create_list_from_cast()?,
            Op::CreateDictionary => {
                let count = self.next_const_usize();
                let mut flat = Vec::with_capacity(count * 2);
                for _ in 0..count * 2 {
                    flat.push(self.pop());
                }
                flat.reverse();
                let dict_id = self.heap.alloc(ObjectData::Dict(Dict::new()));
                let mut entries = flat.into_iter();
                while let (Some(key), Some(value)) = (entries.next(), entries.next()) {
                    if let Err(err) = dict_insert(self.heap, dict_id, key, value) {
                        for leftover in entries {
                            leftover.drop_with_heap(self.heap);
                        }
                        self.heap.dec_ref(dict_id);
                        return Err(err);
                    }
                }
                self.push(Value::Ref(dict_id));
            }
            Op::CreateSet => {
                let count = self.next_const_usize();
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop());
                }
                items.reverse();
                let set_id = self.heap.alloc(ObjectData::Set(Set::new()));
                let mut items = items.into_iter();
                while let Some(item) = items.next() {
                    if let Err(err) = set_add(self.heap, set_id, item) {
                        for leftover in items {
                            leftover.drop_with_heap(self.heap);
                        }
                        self.heap.dec_ref(set_id);
                        return Err(err);
                    }
                }
                self.push(Value::Ref(set_id));
            }
            Op::CreateRange => {
                let increment = self.pop();
                let max = self.pop();
                let min = self.pop();
                let range = Range::new(&min, &max, &increment);
                self.drop_value(min);
                self.drop_value(max);
                self.drop_value(increment);
                let id = self.heap.alloc(ObjectData::Range(range?));
                self.push(Value::Ref(id));
            }
            Op::CreateInstance => self.create_instance()?,
            Op::GetSubscript => self.get_subscript()?,
            Op::AssignSubscript => self.assign_subscript()?,
            Op::LoadMember => self.load_member()?,
            Op::AssignMember => self.assign_member()?,

            Op::Cast => self.cast()?,
            Op::CheckType => self.check_type()?,
            Op::IsObject => {
                let value = self.pop();
                let result = matches!(value, Value::Ref(_));
                self.drop_value(value);
                self.push(Value::Bool(result));
            }
            Op::Typename => {
                let value = self.pop();
                let name = value.type_name(self.heap);
                self.drop_value(value);
                self.push(Value::Str(name));
            }

            Op::EnterTry => {
                let handler_const_idx = self.next_const_usize();
                let handler_op_idx = self.next_const_usize();
                self.try_states.push(TryState {
                    value_stack_len: self.value_stack.len(),
                    locals_len: self.locals.len(),
                    call_stack_len: self.call_stack.len(),
                    op_offsets_len: self.op_const_offsets.len(),
                    locals_offsets_len: self.locals_offsets.len(),
                    held_iterators_len: self.held_iterators.len(),
                    namespace_len: self.namespace_parts.len(),
                    file_stack_len: self.file_hash_stack.len(),
                    handler_const_idx,
                    handler_op_idx,
                });
            }
            Op::ExitTry => {
                let target = self.next_const_usize() + self.locals_base();
                self.truncate_locals(target);
                self.try_states.pop();
            }
            Op::Throw => {
                let value = self.pop();
                let error = match &value {
                    Value::Ref(id) => match self.heap.get(*id).as_exception() {
                        Some(exception) => exception.to_error(),
                        None => GraceError::new(
                            ExcKind::ThrownException,
                            value.to_display_string(self.heap),
                        ),
                    },
                    other => {
                        GraceError::new(ExcKind::ThrownException, other.to_display_string(self.heap))
                    }
                };
                self.drop_value(value);
                return Err(error.into());
            }
            Op::Assert => {
                let condition = self.pop();
                let truthy = condition.as_bool(self.heap);
                self.drop_value(condition);
                if !truthy {
                    return Err(
                        GraceError::new(ExcKind::AssertionFailed, "assertion failed").into()
                    );
                }
            }
            Op::AssertWithMessage => {
                let message = self.next_const_str();
                let condition = self.pop();
                let truthy = condition.as_bool(self.heap);
                self.drop_value(condition);
                if !truthy {
                    return Err(GraceError::new(
                        ExcKind::AssertionFailed,
                        format!("assertion failed: {message}"),
                    )
                    .into());
                }
            }
        }

        Ok(Flow::Continue)
    }

    // --- op helpers -------------------------------------------------------

    fn binary_op(
        &mut self,
        op: fn(&Value, &Value, &Heap) -> RunResult<Value>,
    ) -> RunResult<()> {
        let (a, b) = self.pop_two();
        let result = op(&a, &b, self.heap);
        self.drop_value(a);
        self.drop_value(b);
        self.push(result?);
        Ok(())
    }

    fn comparison_op(
        &mut self,
        op: fn(&Value, &Value, &Heap) -> RunResult<bool>,
    ) -> RunResult<()> {
        let (a, b) = self.pop_two();
        let result = op(&a, &b, self.heap);
        self.drop_value(a);
        self.drop_value(b);
        self.push(Value::Bool(result?));
        Ok(())
    }

    fn compound_assign(
        &mut self,
        op: fn(&Value, &Value, &Heap) -> RunResult<Value>,
    ) -> RunResult<()> {
        let rhs = self.pop();
        let slot = self.local_slot();
        let result = op(&self.locals[slot], &rhs, self.heap);
        self.drop_value(rhs);
        let new_value = result?;
        let old = std::mem::replace(&mut self.locals[slot], new_value);
        self.drop_value(old);
        Ok(())
    }

    fn print_value(&mut self, to_stderr: bool, newline: bool) {
        let value = self.pop();
        let mut text = value.to_display_string(self.heap);
        if newline {
            text.push('\n');
        }
        if to_stderr {
            self.writer.stderr_write(&text);
        } else {
            self.writer.stdout_write(&text);
        }
        self.drop_value(value);
    }

    /// Resolves the callee for `Call`: the current file, or the accumulated
    /// namespace qualifier (which is consumed).
    fn resolve_call_target(&mut self, name: &str, fn_hash: u64) -> RunResult<(u64, u64)> {
        if self.namespace_parts.is_empty() {
            let file_hash = self.current_file_hash();
            if self.program.function(file_hash, fn_hash).is_none() {
                return Err(GraceError::new(
                    ExcKind::FunctionNotFound,
                    format!("cannot find function `{name}`"),
                )
                .into());
            }
            return Ok((file_hash, fn_hash));
        }

        let qualifier = self
            .namespace_parts
            .iter()
            .map(|(text, _)| text.as_str())
            .collect::<Vec<_>>()
            .join("::");
        let path = format!(
            "{}.gr",
            self.namespace_parts
                .iter()
                .map(|(text, _)| text.as_str())
                .collect::<Vec<_>>()
                .join("/")
        );
        self.namespace_parts.clear();

        let file_hash = name_hash(&path);
        if !self.program.functions.contains_key(&file_hash) {
            return Err(GraceError::new(
                ExcKind::NamespaceNotFound,
                format!("namespace `{qualifier}` has not been imported"),
            )
            .into());
        }
        let Some(info) = self.program.function(file_hash, fn_hash) else {
            return Err(GraceError::new(
                ExcKind::FunctionNotFound,
                format!("cannot find function `{name}` in namespace `{qualifier}`"),
            )
            .into());
        };
        if file_hash != self.current_file_hash() && !info.exported {
            return Err(GraceError::new(
                ExcKind::FunctionNotExported,
                format!("function `{name}` has not been exported"),
            )
            .into());
        }
        Ok((file_hash, fn_hash))
    }

    #[expect(clippy::cast_possible_wrap, reason = "cursor positions fit i64 frame markers")]
    fn push_frame(&mut self, file_hash: u64, fn_hash: u64, line: usize) {
        self.call_stack.push(CallFrame {
            caller_hash: self.current_fn_hash,
            callee_hash: fn_hash,
            call_line: line,
            caller_file_hash: self.current_file_hash(),
            callee_file_hash: file_hash,
        });
        self.value_stack.push(Value::Int(self.op_cursor as i64));
        self.value_stack.push(Value::Int(self.const_cursor as i64));
        self.value_stack
            .push(Value::Int(self.held_iterators.len() as i64));

        let info = self
            .program
            .function(file_hash, fn_hash)
            .expect("resolved function vanished");
        self.op_cursor = info.op_start;
        self.const_cursor = info.const_start;
        self.op_const_offsets.push((info.op_start, info.const_start));
        self.file_hash_stack.push(file_hash);
        self.current_fn_hash = fn_hash;
    }

    fn call(&mut self, line: usize) -> RunResult<()> {
        let fn_hash = self.next_const_hash();
        let num_args = self.next_const_usize();
        let name = self.next_const_str();

        let (file_hash, fn_hash) = self.resolve_call_target(&name, fn_hash)?;
        let arity = self
            .program
            .function(file_hash, fn_hash)
            .expect("resolved function vanished")
            .arity;
        if num_args != arity {
            return Err(GraceError::new(
                ExcKind::IncorrectArgCount,
                format!(
                    "Incorrect number of arguments given to function '{name}', expected {arity} \
                     but got {num_args}"
                ),
            )
            .into());
        }

        // Arguments move off the value stack into the new frame's slots.
        let base = self.locals.len();
        self.locals_offsets.push(base);
        for _ in 0..arity {
            self.locals.push(Value::Null);
        }
        for i in (0..arity).rev() {
            self.locals[base + i] = self.pop();
        }

        self.push_frame(file_hash, fn_hash, line);
        Ok(())
    }

    fn member_call(&mut self, line: usize) -> RunResult<()> {
        let name = self.next_const_str();
        let fn_hash = self.next_const_hash();
        let num_args = self.next_const_usize();

        let mut call_args = Vec::with_capacity(num_args);
        for _ in 0..num_args {
            call_args.push(self.pop());
        }
        call_args.reverse();
        let receiver = self.pop();

        let type_name = receiver.type_name(self.heap);
        let type_hash = name_hash(&type_name);
        let Some(&(file_hash, fn_hash)) =
            self.program.extension_methods.get(&(type_hash, fn_hash))
        else {
            receiver.drop_with_heap(self.heap);
            for arg in call_args {
                arg.drop_with_heap(self.heap);
            }
            return Err(GraceError::new(
                ExcKind::FunctionNotFound,
                format!("cannot find function `{name}` for type `{type_name}`"),
            )
            .into());
        };
        let info = self
            .program
            .function(file_hash, fn_hash)
            .expect("extension method not registered");
        if file_hash != self.current_file_hash() && !info.exported {
            receiver.drop_with_heap(self.heap);
            for arg in call_args {
                arg.drop_with_heap(self.heap);
            }
            return Err(GraceError::new(
                ExcKind::FunctionNotExported,
                format!("function `{name}` has not been exported"),
            )
            .into());
        }
        if num_args + 1 != info.arity {
            let arity = info.arity;
            receiver.drop_with_heap(self.heap);
            for arg in call_args {
                arg.drop_with_heap(self.heap);
            }
            return Err(GraceError::new(
                ExcKind::IncorrectArgCount,
                format!(
                    "Incorrect number of arguments given to function '{name}', expected \
                     {} but got {num_args}",
                    arity - 1
                ),
            )
            .into());
        }

        // The receiver is the first local of the callee's frame.
        self.locals_offsets.push(self.locals.len());
        self.locals.push(receiver);
        self.locals.extend(call_args);

        self.push_frame(file_hash, fn_hash, line);
        Ok(())
    }

    fn seed_iterator_vars(
        &mut self,
        iter_id: HeapId,
        two_iterators: bool,
        first_slot: usize,
        second_slot: usize,
    ) -> RunResult<()> {
        let base = self.locals_base();
        if iter_done(self.heap, iter_id) {
            let old = std::mem::replace(&mut self.locals[base + first_slot], Value::Null);
            self.drop_value(old);
            if two_iterators {
                let old = std::mem::replace(&mut self.locals[base + second_slot], Value::Null);
                self.drop_value(old);
            }
            return Ok(());
        }

        if two_iterators {
            let (key, value) = iter_current_pair(self.heap, iter_id)?;
            let old = std::mem::replace(&mut self.locals[base + first_slot], key);
            self.drop_value(old);
            let old = std::mem::replace(&mut self.locals[base + second_slot], value);
            self.drop_value(old);
        } else {
            let value = iter_current(self.heap, iter_id)?;
            let old = std::mem::replace(&mut self.locals[base + first_slot], value);
            self.drop_value(old);
        }
        Ok(())
    }

    fn create_list_from_cast(&mut self) -> RunResult<()> {
        let count = self.next_const_usize();
        if count != 1 {
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(self.pop());
            }
            items.reverse();
            let id = self.heap.alloc(ObjectData::List(List::from_items(items)));
            self.push(Value::Ref(id));
            return Ok(());
        }

        let source = self.pop();
        let items: Vec<Value> = match &source {
            Value::Str(s) => s.chars().map(Value::Char).collect(),
            Value::Ref(id) => match self.heap.get(*id) {
                ObjectData::List(list) => {
                    let len = list.len();
                    (0..len)
                        .filter_map(|i| {
                            self.heap
                                .get(*id)
                                .as_list()
                                .and_then(|l| l.get(i))
                                .map(|v| v.clone_with_heap(self.heap))
                        })
                        .collect()
                }
                ObjectData::Dict(dict) => {
                    let mut pairs = Vec::with_capacity(dict.len());
                    let mut from = 0;
                    while let Some(i) = dict.next_occupied(from) {
                        if let Some(pair_id) = dict.pair_at(i) {
                            self.heap.inc_ref(pair_id);
                            pairs.push(Value::Ref(pair_id));
                        }
                        from = i + 1;
                    }
                    pairs
                }
                ObjectData::Set(set) => {
                    let mut values = Vec::with_capacity(set.len());
                    let mut from = 0;
                    while let Some(i) = set.next_occupied(from) {
                        if let Some(value) = set.value_at(i) {
                            values.push(value.clone_with_heap(self.heap));
                        }
                        from = i + 1;
                    }
                    values
                }
                ObjectData::Range(range) => {
                    let mut values = Vec::new();
                    if range.is_integral() {
                        #[expect(clippy::cast_possible_truncation, reason = "integral ranges came from i64s")]
                        let (mut current, increment) = (range.min() as i64, range.increment() as i64);
                        while range.in_bounds(current as f64) {
                            values.push(Value::Int(current));
                            current = current.wrapping_add(increment);
                        }
                    } else {
                        let mut current = range.min();
                        while range.in_bounds(current) {
                            values.push(Value::Float(current));
                            current += range.increment();
                        }
                    }
                    values
                }
                _ => vec![source.clone_with_heap(self.heap)],
            },
            other => vec![other.clone_primitive()],
        };
        self.drop_value(source);
        let id = self.heap.alloc(ObjectData::List(List::from_items(items)));
        self.push(Value::Ref(id));
        Ok(())
    }

    fn create_instance(&mut self) -> RunResult<()> {
        let member_count = self.next_const_usize();
        let mut member_names = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            member_names.push(self.next_const_str());
        }
        let class_hash = self.next_const_hash();
        let file_hash = self.next_const_hash();

        let class_name = self
            .program
            .classes
            .get(&(class_hash, file_hash))
            .map(|info| info.name.clone())
            .ok_or_else(|| {
                GraceError::invalid_type("instance constructed for an unregistered class")
            })?;

        // The member values are the top `member_count` locals of the frame,
        // declared after the constructor's parameters.
        let base = self.locals.len() - member_count;
        let values = self.locals.split_off(base);
        let members = member_names.into_iter().zip(values).collect();

        let id = self
            .heap
            .alloc(ObjectData::Instance(Instance::new(class_name, members)));
        self.push(Value::Ref(id));
        Ok(())
    }

    fn get_subscript(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();

        let result = (|machine: &mut Self| match (&container, &index) {
            (Value::Ref(id), Value::Int(i)) if machine.heap.get(*id).as_list().is_some() => {
                let list = machine.heap.get(*id).as_list().expect("checked above");
                usize::try_from(*i)
                    .ok()
                    .and_then(|slot| list.get(slot))
                    .map(|value| value.clone_with_heap(machine.heap))
                    .ok_or_else(|| {
                        GraceError::index_out_of_range(format!(
                            "index {i} out of range for `List` of length {len}",
                            len = list.len()
                        ))
                        .into()
                    })
            }
            (Value::Ref(id), key) if machine.heap.get(*id).as_dict().is_some() => {
                dict_get(machine.heap, *id, key)
            }
            (Value::Str(s), Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|char_index| s.chars().nth(char_index))
                .map(Value::Char)
                .ok_or_else(|| {
                    GraceError::index_out_of_range(format!(
                        "index {i} out of range for `String` of length {len}",
                        len = s.chars().count()
                    ))
                    .into()
                }),
            _ => Err(GraceError::invalid_type(format!(
                "cannot subscript `{}` with `{}`",
                container.type_name(machine.heap),
                index.type_name(machine.heap)
            ))
            .into()),
        })(self);

        self.drop_value(index);
        self.drop_value(container);
        self.push(result?);
        Ok(())
    }

    fn assign_subscript(&mut self) -> RunResult<()> {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();

        match &container {
            Value::Ref(id) if self.heap.get(*id).as_list().is_some() => {
                let list_id = *id;
                let result = match &index {
                    Value::Int(i) => {
                        let len = self.heap.get(list_id).as_list().expect("checked above").len();
                        usize::try_from(*i).ok().filter(|slot| *slot < len).ok_or_else(|| {
                            RunError::from(GraceError::index_out_of_range(format!(
                                "index {i} out of range for `List` of length {len}"
                            )))
                        })
                    }
                    other => Err(GraceError::invalid_type(format!(
                        "`List` index must be an `Int`, got `{}`",
                        other.type_name(self.heap)
                    ))
                    .into()),
                };
                match result {
                    Ok(slot) => {
                        let old = self
                            .heap
                            .get_mut(list_id)
                            .as_list_mut()
                            .expect("checked above")
                            .set(slot, value)
                            .expect("bounds checked above");
                        self.drop_value(old);
                        self.drop_value(index);
                        self.drop_value(container);
                        Ok(())
                    }
                    Err(err) => {
                        self.drop_value(value);
                        self.drop_value(index);
                        self.drop_value(container);
                        Err(err)
                    }
                }
            }
            Value::Ref(id) if self.heap.get(*id).as_dict().is_some() => {
                let dict_id = *id;
                let result = dict_insert(self.heap, dict_id, index, value);
                self.drop_value(container);
                result
            }
            _ => {
                let message = format!(
                    "cannot assign into subscript of `{}`",
                    container.type_name(self.heap)
                );
                self.drop_value(value);
                self.drop_value(index);
                self.drop_value(container);
                Err(GraceError::invalid_type(message).into())
            }
        }
    }

    fn load_member(&mut self) -> RunResult<()> {
        let member_name = self.next_const_str();
        let receiver = self.pop();

        let result = match &receiver {
            Value::Ref(id) => match self.heap.get(*id).as_instance() {
                Some(instance) => instance
                    .member(&member_name)
                    .map(|value| value.clone_with_heap(self.heap))
                    .ok_or_else(|| {
                        RunError::from(GraceError::new(
                            ExcKind::MemberNotFound,
                            format!(
                                "could not find member `{member_name}` on instance of \
                                 `{}`",
                                instance.class_name()
                            ),
                        ))
                    }),
                None => Err(GraceError::invalid_type(format!(
                    "cannot access member `{member_name}` on `{}`",
                    receiver.type_name(self.heap)
                ))
                .into()),
            },
            other => Err(GraceError::invalid_type(format!(
                "cannot access member `{member_name}` on `{}`",
                other.type_name(self.heap)
            ))
            .into()),
        };

        self.drop_value(receiver);
        self.push(result?);
        Ok(())
    }

    fn assign_member(&mut self) -> RunResult<()> {
        let member_name = self.next_const_str();
        let value = self.pop();
        let receiver = self.pop();

        let instance_id = match &receiver {
            Value::Ref(id) if self.heap.get(*id).as_instance().is_some() => Some(*id),
            _ => None,
        };

        match instance_id {
            Some(id) => {
                let replaced = self
                    .heap
                    .get_mut(id)
                    .as_instance_mut()
                    .expect("checked above")
                    .set_member(&member_name, value);
                match replaced {
                    Some(old) => {
                        self.drop_value(old);
                        self.drop_value(receiver);
                        Ok(())
                    }
                    None => {
                        // set_member refused, so the value is still ours to
                        // reclaim: it was moved in, get it back via replace.
                        let class_name = self
                            .heap
                            .get(id)
                            .as_instance()
                            .expect("checked above")
                            .class_name()
                            .to_owned();
                        self.drop_value(receiver);
                        Err(GraceError::new(
                            ExcKind::MemberNotFound,
                            format!(
                                "could not find member `{member_name}` on instance of \
                                 `{class_name}`"
                            ),
                        )
                        .into())
                    }
                }
            }
            None => {
                let message = format!(
                    "cannot assign member `{member_name}` on `{}`",
                    receiver.type_name(self.heap)
                );
                self.drop_value(value);
                self.drop_value(receiver);
                Err(GraceError::invalid_type(message).into())
            }
        }
    }

    fn cast(&mut self) -> RunResult<()> {
        let tag = self.next_const_int();

        if tag == 6 {
            // KeyValuePair(key, value)
            let value = self.pop();
            let key = self.pop();
            let id = self
                .heap
                .alloc(ObjectData::Pair(KeyValuePair::new(key, value)));
            self.push(Value::Ref(id));
            return Ok(());
        }

        let value = self.pop();
        let result = match tag {
            0 => value.to_int(self.heap).map(Value::Int),
            1 => value.to_float(self.heap).map(Value::Float),
            2 => Ok(Value::Bool(value.as_bool(self.heap))),
            3 => Ok(Value::Str(value.to_display_string(self.heap))),
            4 => value.to_char(self.heap).map(Value::Char),
            5 => {
                let message = value.to_display_string(self.heap);
                let id = self.heap.alloc(ObjectData::Exception(ExceptionObj::new(
                    ExcKind::ThrownException,
                    message,
                )));
                Ok(Value::Ref(id))
            }
            _ => panic!("unknown cast tag {tag}"),
        };
        self.drop_value(value);
        self.push(result?);
        Ok(())
    }

    fn check_type(&mut self) -> RunResult<()> {
        let tag = self.next_const_int();
        let class_name = if tag == 11 { Some(self.next_const_str()) } else { None };
        let value = self.pop();

        let matches = match tag {
            0 => value.type_of() == Type::Bool,
            1 => value.type_of() == Type::Char,
            2 => value.type_of() == Type::Float,
            3 => value.type_of() == Type::Int,
            4 => value.type_of() == Type::Null,
            5 => value.type_of() == Type::String,
            6 => matches!(&value, Value::Ref(id) if self.heap.get(*id).as_list().is_some()),
            7 => matches!(&value, Value::Ref(id) if self.heap.get(*id).as_dict().is_some()),
            8 => matches!(&value, Value::Ref(id) if self.heap.get(*id).as_exception().is_some()),
            9 => matches!(&value, Value::Ref(id) if self.heap.get(*id).as_pair().is_some()),
            10 => matches!(&value, Value::Ref(id) if self.heap.get(*id).as_set().is_some()),
            11 => {
                let expected = class_name.expect("class tag carries the name");
                matches!(
                    &value,
                    Value::Ref(id)
                        if self
                            .heap
                            .get(*id)
                            .as_instance()
                            .is_some_and(|instance| instance.class_name() == expected)
                )
            }
            _ => panic!("unknown type-check tag {tag}"),
        };
        self.drop_value(value);
        self.push(Value::Bool(matches));
        Ok(())
    }

    // --- exceptions -------------------------------------------------------

    /// Restores the innermost try snapshot and jumps to its handler with the
    /// exception bound on the stack. Returns false when no handler exists.
    fn unwind_to_handler(&mut self, err: &GraceError) -> bool {
        let Some(state) = self.try_states.last().copied() else {
            return false;
        };

        self.truncate_value_stack(state.value_stack_len);
        self.truncate_locals(state.locals_len);
        self.call_stack.truncate(state.call_stack_len);
        self.op_const_offsets.truncate(state.op_offsets_len);
        self.locals_offsets.truncate(state.locals_offsets_len);
        self.truncate_held_iterators(state.held_iterators_len);
        self.namespace_parts.truncate(state.namespace_len);
        self.file_hash_stack.truncate(state.file_stack_len);

        let (op_start, const_start) = *self.op_const_offsets.last().expect("no active frame");
        self.op_cursor = state.handler_op_idx + op_start;
        self.const_cursor = state.handler_const_idx + const_start;
        self.current_fn_hash = self
            .call_stack
            .last()
            .map_or(self.current_fn_hash, |frame| frame.callee_hash);

        let exc_id = self.heap.alloc(ObjectData::Exception(ExceptionObj::new(
            err.kind,
            err.message.clone(),
        )));
        self.value_stack.push(Value::Ref(exc_id));
        true
    }

    fn function_name(&self, file_hash: u64, fn_hash: u64) -> String {
        self.program
            .function(file_hash, fn_hash)
            .map_or_else(|| "<unknown>".to_owned(), |info| info.name.clone())
    }

    fn trace_frame(&mut self, frame: &CallFrame) {
        let name = self.function_name(frame.caller_file_hash, frame.caller_hash);
        self.writer
            .stderr_write(&format!("line {}, in {name}:\n", frame.call_line));
        let file_name = self.program.file_names.get(&frame.caller_file_hash);
        let code = file_name
            .and_then(|file| self.program.source_line(file, frame.call_line))
            .unwrap_or("");
        self.writer.stderr_write(&format!("{code:>4}\n"));
    }

    fn report_runtime_error(&mut self, err: &GraceError, line: usize) {
        self.writer.stderr_write("\n");
        self.writer
            .stderr_write("Call stack (most recent call last):\n");

        let frames: Vec<CallFrame> = self.call_stack.iter().skip(1).copied().collect();
        if frames.len() > CALLSTACK_TRACE_LIMIT
            && std::env::var_os("GRACE_SHOW_FULL_CALLSTACK").is_none()
        {
            self.writer.stderr_write(&format!(
                "{} more calls before - set environment variable `GRACE_SHOW_FULL_CALLSTACK` to \
                 see full callstack\n",
                frames.len() - CALLSTACK_TRACE_LIMIT
            ));
            for frame in frames
                .iter()
                .skip(frames.len() - CALLSTACK_TRACE_LIMIT)
                .copied()
                .collect::<Vec<_>>()
            {
                self.trace_frame(&frame);
            }
        } else {
            for frame in frames {
                self.trace_frame(&frame);
            }
        }

        let current_file_hash = self.current_file_hash();
        let name = self.function_name(current_file_hash, self.current_fn_hash);
        self.writer.stderr_write(&format!("line {line}, in {name}:\n"));
        let code = self
            .program
            .file_names
            .get(&current_file_hash)
            .and_then(|file| self.program.source_line(file, line))
            .unwrap_or("");
        self.writer.stderr_write(&format!("{code:>4}\n"));

        self.writer.stderr_write("\n");
        self.writer.stderr_write(&format!(
            "\x1b[31;1mERROR: \x1b[0m[line {line}] {err}. Stopping execution.\n"
        ));
    }
}
