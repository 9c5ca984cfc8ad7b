//! Per-function bytecode buffers and the program-wide registration tables
//! the compiler emits into, plus the linearisation step that turns them into
//! the single op/constant stream the VM executes.

use ahash::AHashMap;
use indexmap::IndexMap;

use super::{Op, OpLine};
use crate::{hashing::name_hash, value::Value};

/// A function while it is being compiled: its own op and constant buffers
/// plus the metadata the VM needs to link calls to it.
#[derive(Debug)]
pub struct FunctionProto {
    pub name: String,
    pub name_hash: u64,
    pub arity: usize,
    pub file_hash: u64,
    pub exported: bool,
    /// Receiver type-name hash when this is an extension method.
    pub extension_of: Option<u64>,
    pub ops: Vec<OpLine>,
    pub constants: Vec<Value>,
    /// Offsets into the global streams, assigned at linearisation.
    pub op_start: usize,
    pub const_start: usize,
}

/// A registered class: display name for instances plus diagnostics.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
}

/// Call target metadata in the linearised program.
#[derive(Debug)]
pub struct FunctionInfo {
    pub name: String,
    pub arity: usize,
    pub exported: bool,
    pub file_hash: u64,
    pub op_start: usize,
    pub const_start: usize,
}

/// The linearised program: one flat op stream, one flat constant stream, and
/// the lookup tables for calls, classes and extension methods.
#[derive(Debug)]
pub struct Program {
    pub ops: Vec<OpLine>,
    pub constants: Vec<Value>,
    /// file hash -> function name hash -> info.
    pub functions: AHashMap<u64, AHashMap<u64, FunctionInfo>>,
    /// (receiver type hash, function name hash) -> (file hash, name hash).
    pub extension_methods: AHashMap<(u64, u64), (u64, u64)>,
    /// (class name hash, file hash) -> class info.
    pub classes: AHashMap<(u64, u64), ClassInfo>,
    /// file hash -> file name, for diagnostics.
    pub file_names: AHashMap<u64, String>,
    pub entry_file_hash: u64,
    /// file name -> source text, for runtime error context lines.
    pub sources: AHashMap<String, String>,
}

impl Program {
    #[must_use]
    pub fn function(&self, file_hash: u64, fn_hash: u64) -> Option<&FunctionInfo> {
        self.functions.get(&file_hash)?.get(&fn_hash)
    }

    #[must_use]
    pub fn source_line(&self, file_name: &str, line: usize) -> Option<&str> {
        self.sources.get(file_name)?.lines().nth(line.checked_sub(1)?)
    }
}

/// The compiler's emission target.
///
/// Exactly one function is "current" at any time; every emitted op and
/// constant goes into its buffers, mirroring how declarations nest in the
/// grammar (functions cannot nest).
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    /// file hash -> name hash -> proto, both levels in declaration order so
    /// linearisation is deterministic.
    functions: IndexMap<u64, IndexMap<u64, FunctionProto>>,
    classes: AHashMap<(u64, u64), ClassInfo>,
    extension_methods: AHashMap<(u64, u64), (u64, u64)>,
    file_names: AHashMap<u64, String>,
    current: Option<(u64, u64)>,
}

impl ProgramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function and makes it current. Returns `false` when a
    /// function or class with the same name already exists in the file.
    pub fn begin_function(
        &mut self,
        name: &str,
        arity: usize,
        file_name: &str,
        exported: bool,
        extension_of: Option<u64>,
    ) -> bool {
        let fn_hash = name_hash(name);
        let file_hash = name_hash(file_name);
        self.file_names
            .entry(file_hash)
            .or_insert_with(|| file_name.to_owned());

        let file_functions = self.functions.entry(file_hash).or_default();
        if file_functions.contains_key(&fn_hash) {
            return false;
        }
        file_functions.insert(
            fn_hash,
            FunctionProto {
                name: name.to_owned(),
                name_hash: fn_hash,
                arity,
                file_hash,
                exported,
                extension_of,
                ops: Vec::new(),
                constants: Vec::new(),
                op_start: 0,
                const_start: 0,
            },
        );
        if let Some(type_hash) = extension_of {
            self.extension_methods
                .insert((type_hash, fn_hash), (file_hash, fn_hash));
        }
        self.current = Some((file_hash, fn_hash));
        true
    }

    /// Registers a class name. Returns `false` on a duplicate in the file.
    pub fn add_class(&mut self, name: &str, file_name: &str) -> bool {
        let key = (name_hash(name), name_hash(file_name));
        if self.classes.contains_key(&key) {
            return false;
        }
        self.classes.insert(
            key,
            ClassInfo {
                name: name.to_owned(),
            },
        );
        true
    }

    fn current_mut(&mut self) -> &mut FunctionProto {
        let (file, func) = self.current.expect("emitting outside a function");
        self.functions
            .get_mut(&file)
            .and_then(|f| f.get_mut(&func))
            .expect("current function missing")
    }

    fn current_ref(&self) -> &FunctionProto {
        let (file, func) = self.current.expect("emitting outside a function");
        self.functions
            .get(&file)
            .and_then(|f| f.get(&func))
            .expect("current function missing")
    }

    pub fn emit_op(&mut self, op: Op, line: usize) {
        self.current_mut().ops.push(OpLine::new(op, line));
    }

    pub fn emit_constant(&mut self, value: Value) {
        self.current_mut().constants.push(value);
    }

    /// Patches a previously reserved constant slot (forward jumps).
    pub fn set_constant_at(&mut self, index: usize, value: Value) {
        self.current_mut().constants[index] = value;
    }

    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.current_ref().ops.len()
    }

    #[must_use]
    pub fn num_constants(&self) -> usize {
        self.current_ref().constants.len()
    }

    #[must_use]
    pub fn last_op(&self) -> Option<Op> {
        self.current_ref().ops.last().map(|op_line| op_line.op)
    }

    #[must_use]
    pub fn current_function_name(&self) -> &str {
        &self.current_ref().name
    }

    /// Concatenates every function's buffers into the global streams,
    /// recording each function's start offsets. `main` is placed first so
    /// execution begins at offset zero.
    pub fn finalise(
        mut self,
        entry_file_name: &str,
        sources: AHashMap<String, String>,
    ) -> Result<Program, String> {
        let entry_file_hash = name_hash(entry_file_name);
        let main_hash = name_hash("main");
        if !self
            .functions
            .get(&entry_file_hash)
            .is_some_and(|file| file.contains_key(&main_hash))
        {
            return Err("Could not find `main` function in file, execution cannot proceed".into());
        }

        let mut ops = Vec::new();
        let mut constants = Vec::new();
        {
            let main = self
                .functions
                .get_mut(&entry_file_hash)
                .and_then(|file| file.get_mut(&main_hash))
                .expect("main vanished between lookup and linearisation");
            main.op_start = 0;
            main.const_start = 0;
            ops.extend(main.ops.iter().copied());
            constants.append(&mut main.constants);
        }

        let mut functions: AHashMap<u64, AHashMap<u64, FunctionInfo>> = AHashMap::new();
        for (file_hash, file_functions) in &mut self.functions {
            for (fn_hash, proto) in file_functions {
                let is_main = *file_hash == entry_file_hash && *fn_hash == main_hash;
                if !is_main {
                    proto.op_start = ops.len();
                    proto.const_start = constants.len();
                    ops.extend(proto.ops.iter().copied());
                    constants.append(&mut proto.constants);
                }
                functions.entry(*file_hash).or_default().insert(
                    *fn_hash,
                    FunctionInfo {
                        name: proto.name.clone(),
                        arity: proto.arity,
                        exported: proto.exported,
                        file_hash: proto.file_hash,
                        op_start: proto.op_start,
                        const_start: proto.const_start,
                    },
                );
            }
        }

        Ok(Program {
            ops,
            constants,
            functions,
            extension_methods: self.extension_methods,
            classes: self.classes,
            file_names: self.file_names,
            entry_file_hash,
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn duplicate_function_names_are_rejected_per_file() {
        let mut builder = ProgramBuilder::new();
        assert!(builder.begin_function("foo", 0, "a.gr", false, None));
        assert!(!builder.begin_function("foo", 1, "a.gr", false, None));
        assert!(builder.begin_function("foo", 0, "b.gr", false, None));
    }

    #[test]
    fn linearisation_places_main_first() {
        let mut builder = ProgramBuilder::new();
        builder.begin_function("helper", 0, "a.gr", false, None);
        builder.emit_op(Op::LoadConstant, 1);
        builder.emit_constant(Value::Null);
        builder.emit_op(Op::Return, 1);
        builder.begin_function("main", 0, "a.gr", false, None);
        builder.emit_op(Op::Exit, 2);

        let program = builder.finalise("a.gr", AHashMap::new()).unwrap();
        assert!(matches!(program.ops[0].op, Op::Exit));
        let helper = program
            .function(name_hash("a.gr"), name_hash("helper"))
            .unwrap();
        assert_eq!(helper.op_start, 1);
        assert_eq!(helper.const_start, 0);
    }

    #[test]
    fn missing_main_fails_finalisation() {
        let mut builder = ProgramBuilder::new();
        builder.begin_function("helper", 0, "a.gr", false, None);
        builder.emit_op(Op::Return, 1);
        assert!(builder.finalise("a.gr", AHashMap::new()).is_err());
    }
}
