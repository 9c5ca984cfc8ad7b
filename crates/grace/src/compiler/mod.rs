//! Single-pass recursive-descent compiler.
//!
//! There is no AST: every production that has a runtime effect emits ops and
//! constants straight into the current function's buffers. A stack of file
//! contexts mirrors the scanner stack, so `import` suspends the including
//! file mid-declaration and resumes it when the imported file is drained.

mod helpers;

use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};

use crate::{
    bytecode::{Op, Program, ProgramBuilder},
    diagnostics::{Diagnostic, LogLevel, render},
    hashing::name_hash,
    scanner::{Scanner, SourceMap, Token, TokenKind},
    value::Value,
    vm::natives,
};

use helpers::{
    edit_distance, is_compound_assignment, is_literal, is_number, is_operator, is_type_ident,
    is_valid_type_annotation, keyword_spelling, parse_char, parse_float, parse_int, parse_string,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub verbose: bool,
    pub warnings_error: bool,
}

/// Why a compilation failed, with both structured diagnostics and the
/// rendered report text.
#[derive(Debug)]
pub struct CompileFailure {
    pub diagnostics: Vec<Diagnostic>,
    pub rendered: String,
}

/// Compiles a file from disk, following its imports.
pub fn compile_file(path: &Path, options: CompileOptions) -> Result<Program, CompileFailure> {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            return Err(CompileFailure {
                diagnostics: Vec::new(),
                rendered: format!("Error reading file `{}`: {err}\n", path.display()),
            });
        }
    };
    compile_source(&path.to_string_lossy(), source, options)
}

/// Compiles an in-memory source registered under `file_name`. Imports are
/// resolved relative to the file's parent directory.
pub fn compile_source(
    file_name: &str,
    source: String,
    options: CompileOptions,
) -> Result<Program, CompileFailure> {
    let full_path =
        std::path::absolute(file_name).unwrap_or_else(|_| PathBuf::from(file_name));
    let mut session = Session::new(options, file_name.to_owned());
    session.push_file(file_name.to_owned(), full_path, source);
    session.run()
}

/// Lexical position driving what is allowed where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeContext {
    Catch,
    Class,
    Constructor,
    ForLoop,
    Function,
    If,
    TopLevel,
    Try,
    WhileLoop,
}

#[derive(Debug)]
struct Local {
    name: String,
    is_final: bool,
    is_iterator: bool,
    index: i64,
}

#[derive(Debug)]
struct ConstantDef {
    value: Value,
    exported: bool,
}

/// Per-file compiler state; one entry per active source file.
struct FileContext {
    scanner: Scanner,
    code_context_stack: Vec<CodeContext>,
    file_name: String,
    full_path: PathBuf,
    parent_path: PathBuf,
    current: Option<Token>,
    previous: Option<Token>,
    locals: Vec<Local>,
    panic_mode: bool,
    passed_imports: bool,
    namespace_qualifier_used: bool,
    current_namespace_lookup: String,
    using_expression_result: bool,
    break_idx_stack: Vec<Vec<(usize, usize)>>,
    continue_idx_stack: Vec<Vec<(usize, usize)>>,
    break_jump_needs_indexes: bool,
    continue_jump_needs_indexes: bool,
}

struct Session {
    options: CompileOptions,
    entry_file_name: String,
    builder: ProgramBuilder,
    source_map: SourceMap,
    loaded_paths: AHashSet<PathBuf>,
    /// full path string -> constant name -> definition.
    constants: AHashMap<String, AHashMap<String, ConstantDef>>,
    contexts: Vec<FileContext>,
    diagnostics: Vec<Diagnostic>,
    rendered: String,
    had_error: bool,
    had_warning: bool,
}

impl Session {
    fn new(options: CompileOptions, entry_file_name: String) -> Self {
        Self {
            options,
            entry_file_name,
            builder: ProgramBuilder::new(),
            source_map: SourceMap::new(),
            loaded_paths: AHashSet::new(),
            constants: AHashMap::new(),
            contexts: Vec::new(),
            diagnostics: Vec::new(),
            rendered: String::new(),
            had_error: false,
            had_warning: false,
        }
    }

    fn push_file(&mut self, file_name: String, full_path: PathBuf, source: String) {
        let parent_path = full_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        self.source_map.insert(file_name.clone(), source.clone());
        self.loaded_paths.insert(full_path.clone());

        let full_path_string = full_path.to_string_lossy().into_owned();
        self.constants.entry(full_path_string.clone()).or_default().insert(
            "__FILE".to_owned(),
            ConstantDef {
                value: Value::Str(full_path_string),
                exported: false,
            },
        );

        self.contexts.push(FileContext {
            scanner: Scanner::new(&source),
            code_context_stack: vec![CodeContext::TopLevel],
            file_name,
            full_path,
            parent_path,
            current: None,
            previous: None,
            locals: Vec::new(),
            panic_mode: false,
            passed_imports: false,
            namespace_qualifier_used: true,
            current_namespace_lookup: String::new(),
            using_expression_result: false,
            break_idx_stack: Vec::new(),
            continue_idx_stack: Vec::new(),
            break_jump_needs_indexes: false,
            continue_jump_needs_indexes: false,
        });
        self.advance();
    }

    fn run(mut self) -> Result<Program, CompileFailure> {
        while !self.contexts.is_empty() {
            if self.match_kind(TokenKind::EndOfFile) {
                self.contexts.pop();
                continue;
            }
            self.declaration();
            if self.had_error {
                break;
            }
        }
        self.contexts.clear();

        if self.had_error {
            self.rendered
                .push_str("Terminating process due to compilation errors.\n");
            return Err(CompileFailure {
                diagnostics: self.diagnostics,
                rendered: self.rendered,
            });
        }
        if self.had_warning && self.options.warnings_error {
            self.rendered
                .push_str("Terminating process due to compilation warnings treated as errors.\n");
            return Err(CompileFailure {
                diagnostics: self.diagnostics,
                rendered: self.rendered,
            });
        }

        let entry = self.entry_file_name.clone();
        self.builder
            .finalise(&entry, self.source_map.into_sources())
            .map_err(|message| CompileFailure {
                diagnostics: vec![Diagnostic {
                    level: LogLevel::Error,
                    message: message.clone(),
                    file: entry,
                    line: 0,
                    column: 0,
                }],
                rendered: format!("ERROR: {message}\n"),
            })
    }

    // --- token plumbing ---------------------------------------------------

    fn ctx(&mut self) -> &mut FileContext {
        self.contexts.last_mut().expect("no active file context")
    }

    fn ctx_ref(&self) -> &FileContext {
        self.contexts.last().expect("no active file context")
    }

    fn advance(&mut self) {
        let ctx = self.ctx();
        ctx.previous = ctx.current.take();
        let token = ctx.scanner.scan_token();
        ctx.current = Some(token);
        if self.current_kind() == TokenKind::Error {
            self.error_at_current("Unexpected token");
        }
    }

    fn current_kind(&self) -> TokenKind {
        self.ctx_ref()
            .current
            .as_ref()
            .map_or(TokenKind::EndOfFile, |t| t.kind)
    }

    fn previous_kind(&self) -> TokenKind {
        self.ctx_ref()
            .previous
            .as_ref()
            .map_or(TokenKind::EndOfFile, |t| t.kind)
    }

    fn current_token(&self) -> Token {
        self.ctx_ref().current.clone().expect("no current token")
    }

    fn previous_token(&self) -> Token {
        self.ctx_ref().previous.clone().expect("no previous token")
    }

    fn previous_lexeme(&self) -> String {
        self.previous_token().lexeme
    }

    fn previous_line(&self) -> usize {
        self.ctx_ref().previous.as_ref().map_or(1, |t| t.line)
    }

    fn current_line(&self) -> usize {
        self.ctx_ref().current.as_ref().map_or(1, |t| t.line)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_kind() == kind
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current_kind() == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // --- diagnostics ------------------------------------------------------

    fn message_at(&mut self, token: &Token, message: &str, level: LogLevel) {
        if level == LogLevel::Error || self.options.warnings_error {
            if self.ctx_ref().panic_mode {
                return;
            }
            self.ctx().panic_mode = true;
        }

        let (file_path, source_key) = {
            let ctx = self.ctx_ref();
            (
                ctx.full_path.to_string_lossy().into_owned(),
                ctx.file_name.clone(),
            )
        };
        self.rendered.push_str(&render(
            token,
            message,
            level,
            &file_path,
            &self.source_map,
            &source_key,
        ));
        self.diagnostics.push(Diagnostic {
            level,
            message: message.to_owned(),
            file: file_path,
            line: token.line,
            column: token.column.saturating_sub(token.length()).max(1),
        });

        match level {
            LogLevel::Error => self.had_error = true,
            LogLevel::Warning => self.had_warning = true,
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current_token();
        self.message_at(&token, message, LogLevel::Error);
    }

    fn error_at_previous(&mut self, message: &str) {
        let token = self.previous_token();
        self.message_at(&token, message, LogLevel::Error);
    }

    fn warning_at_current(&mut self, message: &str) {
        let token = self.current_token();
        self.message_at(&token, message, LogLevel::Warning);
    }

    fn warning_at_previous(&mut self, message: &str) {
        let token = self.previous_token();
        self.message_at(&token, message, LogLevel::Warning);
    }

    /// Warnings are only surfaced in verbose mode or when they are promoted
    /// to errors.
    fn warnings_enabled(&self) -> bool {
        self.options.verbose || self.options.warnings_error
    }

    fn synchronize(&mut self) {
        self.ctx().panic_mode = false;
        while self.current_kind() != TokenKind::EndOfFile {
            if self.previous_kind() == TokenKind::Semicolon {
                return;
            }
            match self.current_kind() {
                TokenKind::Class
                | TokenKind::Constructor
                | TokenKind::Func
                | TokenKind::Final
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::PrintLn
                | TokenKind::Eprint
                | TokenKind::EprintLn
                | TokenKind::Return
                | TokenKind::Var => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- emission helpers -------------------------------------------------

    fn emit_op(&mut self, op: Op, line: usize) {
        self.builder.emit_op(op, line);
    }

    fn emit_const(&mut self, value: Value) {
        self.builder.emit_constant(value);
    }

    fn emit_const_int(&mut self, value: i64) {
        self.builder.emit_constant(Value::Int(value));
    }

    #[expect(clippy::cast_possible_wrap, reason = "hashes round-trip through Int constants")]
    fn emit_const_hash(&mut self, hash: u64) {
        self.builder.emit_constant(Value::Int(hash as i64));
    }

    /// Reserves the two constant slots of a forward jump, returning their
    /// indices `(const slot, op slot)` for later patching.
    fn reserve_jump_slots(&mut self) -> (usize, usize) {
        let const_slot = self.builder.num_constants();
        self.emit_const_int(0);
        let op_slot = self.builder.num_constants();
        self.emit_const_int(0);
        (const_slot, op_slot)
    }

    /// Points a reserved jump at the current end of the function.
    #[expect(clippy::cast_possible_wrap, reason = "buffer indices fit i64")]
    fn patch_jump_to_here(&mut self, slots: (usize, usize)) {
        let num_constants = self.builder.num_constants() as i64;
        let num_ops = self.builder.num_ops() as i64;
        self.builder.set_constant_at(slots.0, Value::Int(num_constants));
        self.builder.set_constant_at(slots.1, Value::Int(num_ops));
    }

    /// Runs `parse` with `using_expression_result` forced on, restoring the
    /// previous flag afterwards.
    fn with_expression_used(&mut self, parse: impl FnOnce(&mut Self)) {
        let prev = self.ctx_ref().using_expression_result;
        self.ctx().using_expression_result = true;
        parse(self);
        self.ctx().using_expression_result = prev;
    }

    fn pop_unused_expression_result(&mut self) {
        if self.check(TokenKind::Semicolon) && !self.ctx_ref().using_expression_result {
            let line = self.previous_line();
            self.emit_op(Op::Pop, line);
        }
    }

    // --- declarations -----------------------------------------------------

    fn declaration(&mut self) {
        if self.match_kind(TokenKind::Import) {
            self.import_declaration();
        } else if self.match_kind(TokenKind::Class) {
            self.ctx().passed_imports = true;
            self.class_declaration();
        } else if self.match_kind(TokenKind::Func) {
            self.ctx().passed_imports = true;
            self.func_declaration();
        } else if self.match_kind(TokenKind::Var) {
            self.ctx().passed_imports = true;
            self.var_declaration(false);
        } else if self.match_kind(TokenKind::Final) {
            self.ctx().passed_imports = true;
            self.var_declaration(true);
        } else if self.match_kind(TokenKind::Const) {
            self.const_declaration();
        } else {
            self.statement();
        }

        if !self.contexts.is_empty() && self.ctx_ref().panic_mode {
            self.synchronize();
        }
    }

    fn import_declaration(&mut self) {
        if self.ctx_ref().passed_imports {
            self.error_at_previous("`import` only allowed before any other declarations");
            return;
        }

        let mut import_path = String::new();
        let mut is_std = false;
        let mut last_token: Option<Token> = None;
        loop {
            if !self.match_kind(TokenKind::Identifier) {
                self.error_at_current("Expected path");
                return;
            }
            let segment = self.previous_lexeme();
            if import_path.is_empty() && segment == "std" {
                is_std = true;
            }
            import_path.push_str(&segment);
            last_token = Some(self.previous_token());
            if self.match_kind(TokenKind::Semicolon) {
                import_path.push_str(".gr");
                break;
            }
            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated `import` statement");
                return;
            }
            self.consume(TokenKind::ColonColon, "Expected `::` for path continuation");
            if self.ctx_ref().panic_mode {
                return;
            }
            import_path.push('/');
        }
        let last_token = last_token.expect("import path parsed without a segment");

        let in_path = if is_std {
            match std::env::var("GRACE_STD_PATH") {
                Ok(std_path) => Path::new(&std_path).join(&import_path[4..]),
                Err(_) => {
                    self.message_at(
                        &last_token,
                        &format!(
                            "The `GRACE_STD_PATH` environment variable has not been set, so cannot \
                             continue importing file {import_path}"
                        ),
                        LogLevel::Error,
                    );
                    return;
                }
            }
        } else {
            self.ctx_ref().parent_path.join(&import_path)
        };
        let in_path = std::path::absolute(&in_path).unwrap_or(in_path);

        if !in_path.exists() {
            self.message_at(
                &last_token,
                &format!("Could not find file `{import_path}` to import"),
                LogLevel::Error,
            );
            return;
        }

        let canonical = in_path.canonicalize().unwrap_or(in_path);
        if self.loaded_paths.contains(&canonical) {
            // Re-importing an already-loaded file is silently skipped.
            return;
        }

        let source = match std::fs::read_to_string(&canonical) {
            Ok(source) => source,
            Err(err) => {
                self.message_at(
                    &last_token,
                    &format!("Error reading imported file `{}`: {err}", canonical.display()),
                    LogLevel::Error,
                );
                return;
            }
        };

        self.push_file(import_path, canonical, source);
    }

    fn check_duplicate_local(&self, name: &str) -> bool {
        self.ctx_ref().locals.iter().any(|local| local.name == name)
    }

    fn check_duplicate_constant(&self, name: &str) -> bool {
        let path = self.ctx_ref().full_path.to_string_lossy().into_owned();
        self.constants
            .get(&path)
            .is_some_and(|file| file.contains_key(name))
    }

    /// Skips an optional `: Type` annotation; annotations are parsed and
    /// discarded.
    fn skip_type_annotation(&mut self) -> bool {
        if self.match_kind(TokenKind::Colon) {
            if !is_valid_type_annotation(self.current_kind()) {
                self.error_at_current("Expected type name after type annotation");
                return false;
            }
            self.advance();
        }
        true
    }

    fn class_declaration(&mut self) {
        if *self.ctx_ref().code_context_stack.last().unwrap() != CodeContext::TopLevel {
            self.error_at_previous("Classes only allowed at top level");
            return;
        }
        self.ctx().code_context_stack.push(CodeContext::Class);

        let exported = self.match_kind(TokenKind::Export);

        if !self.match_kind(TokenKind::Identifier) {
            self.error_at_current("Expected identifier after `class`");
            return;
        }
        let class_name_token = self.previous_token();

        if !self.match_kind(TokenKind::Colon) {
            self.error_at_current("Expected ':' after class name");
            return;
        }

        let mut has_defined_constructor = false;
        let mut class_members: Vec<String> = Vec::new();
        let file_name = self.ctx_ref().file_name.clone();

        while !self.match_kind(TokenKind::End) {
            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated class");
                return;
            }

            if self.match_kind(TokenKind::Var) {
                if has_defined_constructor {
                    self.error_at_previous(
                        "Member variable declarations can only come before the constructor",
                    );
                    return;
                }
                self.consume(TokenKind::Identifier, "Expected identifier after `var`");
                if self.ctx_ref().panic_mode {
                    return;
                }
                let member_name = self.previous_lexeme();
                if !self.skip_type_annotation() {
                    return;
                }
                if member_name.starts_with("__") {
                    self.error_at_previous(
                        "Names beginning with double underscore `__` are reserved for internal use",
                    );
                    return;
                }
                if class_members.contains(&member_name) {
                    self.error_at_previous("A class member with the same name already exists");
                    return;
                }
                if self.check_duplicate_constant(&member_name) {
                    self.error_at_previous("A constant with the same name already exists");
                    return;
                }
                class_members.push(member_name);
                self.consume(TokenKind::Semicolon, "Expected ';'");
                if self.ctx_ref().panic_mode {
                    return;
                }
            } else if self.match_kind(TokenKind::Constructor) {
                self.ctx().code_context_stack.push(CodeContext::Constructor);
                has_defined_constructor = true;
                self.consume(TokenKind::LeftParen, "Expected '(' after `constructor`");

                let Some(parameters) = self.parse_parameter_list(&class_members) else {
                    return;
                };

                self.consume(TokenKind::Colon, "Expected ':' after constructor declaration");

                if !self.builder.begin_function(
                    &class_name_token.lexeme,
                    parameters,
                    &file_name,
                    exported,
                    None,
                ) {
                    self.message_at(
                        &class_name_token,
                        "A function or class in the same namespace already exists with the same \
                         name as this class",
                        LogLevel::Error,
                    );
                    return;
                }

                // The instance members become locals declared after the
                // parameters, so the constructor body assigns to them like
                // any other variable.
                for member_name in &class_members {
                    let line = self.previous_line();
                    self.emit_op(Op::DeclareLocal, line);
                    let index = self.ctx_ref().locals.len() as i64;
                    self.ctx().locals.push(Local {
                        name: member_name.clone(),
                        is_final: false,
                        is_iterator: false,
                        index,
                    });
                }

                let num_locals_start = self.ctx_ref().locals.len();
                while !self.match_kind(TokenKind::End) {
                    if self.match_kind(TokenKind::Return) {
                        self.error_at_previous("Cannot return from a constructor");
                        return;
                    }
                    self.declaration();
                    if self.had_error {
                        return;
                    }
                    if self.current_kind() == TokenKind::EndOfFile {
                        self.error_at_current("Expected `end` after constructor");
                        return;
                    }
                }

                if self.ctx_ref().locals.len() > num_locals_start {
                    let line = self.previous_line();
                    self.emit_const_int(num_locals_start as i64);
                    self.emit_op(Op::PopLocals, line);
                }

                self.ctx().code_context_stack.pop();
            } else {
                self.error_at_current("Expected `var` or `constructor` inside class");
                return;
            }
        }

        // A class without an explicit constructor gets an empty one.
        if !has_defined_constructor {
            if !self.builder.begin_function(
                &class_name_token.lexeme,
                0,
                &file_name,
                exported,
                None,
            ) {
                self.message_at(
                    &class_name_token,
                    "A function or class in the same namespace already exists with the same name \
                     as this class",
                    LogLevel::Error,
                );
                return;
            }
            for member_name in &class_members {
                let line = self.previous_line();
                self.emit_op(Op::DeclareLocal, line);
                let index = self.ctx_ref().locals.len() as i64;
                self.ctx().locals.push(Local {
                    name: member_name.clone(),
                    is_final: false,
                    is_iterator: false,
                    index,
                });
            }
        }

        if !self.builder.add_class(&class_name_token.lexeme, &file_name) {
            self.message_at(
                &class_name_token,
                "A class in the same namespace already exists with the same name",
                LogLevel::Error,
            );
            return;
        }

        // Tell the VM how to assemble the instance: the member values are
        // the top `class_members.len()` locals of the frame.
        let line = self.previous_line();
        self.emit_const_int(class_members.len() as i64);
        for member_name in class_members {
            self.emit_const(Value::Str(member_name));
        }
        self.emit_const_hash(name_hash(&class_name_token.lexeme));
        self.emit_const_hash(name_hash(&file_name));
        self.emit_op(Op::CreateInstance, line);

        self.emit_const_int(0);
        self.emit_op(Op::PopLocals, line);
        self.emit_op(Op::Return, line);

        self.ctx().locals.clear();
        self.ctx().code_context_stack.pop();
    }

    /// Parses a `(p1, final p2, ...)` parameter list, declaring the locals.
    /// Returns the parameter count, or `None` after an error.
    fn parse_parameter_list(&mut self, class_members: &[String]) -> Option<usize> {
        let mut parameters: Vec<String> = Vec::new();
        while !self.match_kind(TokenKind::RightParen) {
            if self.match_kind(TokenKind::Identifier) || self.match_kind(TokenKind::Final) {
                let is_final = self.previous_kind() == TokenKind::Final;
                if is_final {
                    self.consume(TokenKind::Identifier, "Expected identifier after `final`");
                    if self.ctx_ref().panic_mode {
                        return None;
                    }
                }
                let name = self.previous_lexeme();
                if name.starts_with("__") {
                    self.error_at_previous(
                        "Names beginning with double underscore `__` are reserved for internal use",
                    );
                    return None;
                }
                if parameters.contains(&name) {
                    self.error_at_previous("Function parameters with the same name already defined");
                    return None;
                }
                if class_members.contains(&name) {
                    self.error_at_previous("Function parameter shadows class member variable");
                    return None;
                }
                if self.check_duplicate_constant(&name) {
                    self.error_at_previous("A constant with the same name already exists");
                    return None;
                }
                let index = self.ctx_ref().locals.len() as i64;
                self.ctx().locals.push(Local {
                    name: name.clone(),
                    is_final,
                    is_iterator: false,
                    index,
                });
                parameters.push(name);

                if !self.skip_type_annotation() {
                    return None;
                }
                if !self.check(TokenKind::RightParen) {
                    self.consume(TokenKind::Comma, "Expected ',' after function parameter");
                    if self.ctx_ref().panic_mode {
                        return None;
                    }
                }
            } else {
                self.error_at_current("Expected identifier or `final`");
                return None;
            }
        }
        Some(parameters.len())
    }

    fn func_declaration(&mut self) {
        if *self.ctx_ref().code_context_stack.last().unwrap() != CodeContext::TopLevel {
            self.error_at_previous("Functions are only allowed at top level");
            return;
        }
        self.ctx().code_context_stack.push(CodeContext::Function);

        let exported = self.match_kind(TokenKind::Export);

        self.consume(TokenKind::Identifier, "Expected function name");
        if self.ctx_ref().panic_mode {
            return;
        }
        let func_name_token = self.previous_token();
        let name = func_name_token.lexeme.clone();
        if name.starts_with("__") {
            self.error_at_previous(
                "Names beginning with double underscore `__` are reserved for internal use",
            );
            return;
        }
        let is_main = name == "main";

        self.consume(TokenKind::LeftParen, "Expected '(' after function name");

        let mut extension_type_hash: Option<u64> = None;
        let mut parameters: Vec<String> = Vec::new();
        while !self.match_kind(TokenKind::RightParen) {
            if is_main && parameters.len() > 1 {
                self.message_at(
                    &func_name_token,
                    &format!(
                        "`main` function can only take 0 or 1 parameter(s) but got {}",
                        parameters.len()
                    ),
                    LogLevel::Error,
                );
                return;
            }

            if self.match_kind(TokenKind::Identifier) || self.match_kind(TokenKind::Final) {
                let is_final = self.previous_kind() == TokenKind::Final;
                if is_final {
                    self.consume(TokenKind::Identifier, "Expected identifier after `final`");
                    if self.ctx_ref().panic_mode {
                        return;
                    }
                }
                let param = self.previous_lexeme();
                if param.starts_with("__") {
                    self.error_at_previous(
                        "Names beginning with double underscore `__` are reserved for internal use",
                    );
                    return;
                }
                if parameters.contains(&param) {
                    self.error_at_previous("Function parameters with the same name already defined");
                    return;
                }
                if self.check_duplicate_constant(&param) {
                    self.error_at_previous("A constant with the same name already exists");
                    return;
                }
                let index = self.ctx_ref().locals.len() as i64;
                self.ctx().locals.push(Local {
                    name: param.clone(),
                    is_final,
                    is_iterator: false,
                    index,
                });
                parameters.push(param);

                if !self.skip_type_annotation() {
                    return;
                }
                if !self.check(TokenKind::RightParen) {
                    self.consume(TokenKind::Comma, "Expected ',' after function parameter");
                    if self.ctx_ref().panic_mode {
                        return;
                    }
                }
            } else if self.match_kind(TokenKind::This) {
                // `this Type name` makes this function an extension method
                // on values whose type name matches.
                if is_main {
                    self.error_at_previous("`this` not allowed in main function");
                    return;
                }
                if !parameters.is_empty() {
                    self.error_at_previous(
                        "`this` can only appear before the first function parameter to make an \
                         extension method",
                    );
                    return;
                }
                let kind = self.current_kind();
                if !is_type_ident(kind) && kind != TokenKind::Identifier {
                    self.error_at_current("Expected type name for extension method");
                    return;
                }
                extension_type_hash = Some(name_hash(&self.current_token().lexeme));
                self.advance();

                self.consume(TokenKind::Identifier, "Expected identifier after type identifier");
                if self.ctx_ref().panic_mode {
                    return;
                }
                let param = self.previous_lexeme();
                if param.starts_with("__") {
                    self.error_at_previous(
                        "Names beginning with double underscore `__` are reserved for internal use",
                    );
                    return;
                }
                if self.check_duplicate_constant(&param) {
                    self.error_at_previous("A constant with the same name already exists");
                    return;
                }
                let index = self.ctx_ref().locals.len() as i64;
                self.ctx().locals.push(Local {
                    name: param.clone(),
                    is_final: false,
                    is_iterator: false,
                    index,
                });
                parameters.push(param);

                if !self.check(TokenKind::RightParen) {
                    self.consume(TokenKind::Comma, "Expected ',' after function parameter");
                    if self.ctx_ref().panic_mode {
                        return;
                    }
                }
            } else {
                self.error_at_current("Expected identifier or `final`");
                return;
            }
        }

        if self.match_kind(TokenKind::ColonColon) {
            if is_main {
                self.error_at_previous("`main` does not return a value");
                return;
            }
            if !is_valid_type_annotation(self.current_kind()) {
                self.error_at_current("Expected type name after type annotation");
                return;
            }
            self.advance();
        }

        // The VM binds the command-line list to the first local of `main`.
        // Reserving the slot under a `__` name stops user code from clashing
        // with it while still letting a declared parameter take it.
        if is_main && parameters.is_empty() {
            self.ctx().locals.push(Local {
                name: "__ARGS".to_owned(),
                is_final: true,
                is_iterator: false,
                index: 0,
            });
        }

        if !self.match_kind(TokenKind::Colon) {
            self.error_at_current("Expected ':' after function signature");
            return;
        }

        let file_name = self.ctx_ref().file_name.clone();
        if !self.builder.begin_function(
            &name,
            parameters.len(),
            &file_name,
            exported,
            extension_type_hash,
        ) {
            self.message_at(
                &func_name_token,
                "A function or class in the same namespace already exists with the same name as \
                 this function",
                LogLevel::Error,
            );
            return;
        }

        while !self.match_kind(TokenKind::End) {
            self.declaration();
            if self.had_error {
                return;
            }
            if self.current_kind() == TokenKind::EndOfFile {
                self.error_at_current("Expected `end` after function");
                return;
            }
        }

        // Implicit return: a function that does not end in `return` yields
        // null so assigning a call's result is always valid.
        if self.builder.last_op() != Some(Op::Return) {
            let line = self.previous_line();
            if !self.ctx_ref().locals.is_empty() {
                self.emit_const_int(0);
                self.emit_op(Op::PopLocals, line);
            }
            if !is_main {
                self.emit_const(Value::Null);
                self.emit_op(Op::LoadConstant, line);
                self.emit_op(Op::Return, line);
            }
        }

        self.ctx().locals.clear();

        if is_main {
            let line = self.previous_line();
            self.emit_op(Op::Exit, line);
        }

        self.ctx().code_context_stack.pop();
    }

    fn var_declaration(&mut self, is_final: bool) {
        if *self.ctx_ref().code_context_stack.last().unwrap() == CodeContext::TopLevel {
            self.error_at_previous("Only functions and classes are allowed at top level");
            return;
        }

        let diagnostic_name = if is_final { "final" } else { "var" };

        if !self.match_kind(TokenKind::Identifier) {
            self.error_at_current(&format!("Expected identifier after `{diagnostic_name}`"));
            return;
        }
        let name_token = self.previous_token();

        if !self.skip_type_annotation() {
            return;
        }

        let local_name = name_token.lexeme.clone();
        if local_name.starts_with("__") {
            self.error_at_previous(
                "Names beginning with double underscore `__` are reserved for internal use",
            );
            return;
        }
        if self.check_duplicate_local(&local_name) {
            self.error_at_previous("A local variable with the same name already exists");
            return;
        }
        if self.check_duplicate_constant(&local_name) {
            self.error_at_previous("A constant with the same name already exists");
            return;
        }

        let mut line = name_token.line;
        let local_id = self.ctx_ref().locals.len() as i64;
        self.emit_op(Op::DeclareLocal, line);

        if self.match_kind(TokenKind::Equal) {
            self.with_expression_used(|session| session.expression(false));
            line = self.previous_line();
            self.emit_const_int(local_id);
            self.emit_op(Op::AssignLocal, line);
        } else if is_final {
            self.error_at_current("Must assign to `final` upon declaration");
            return;
        }

        self.ctx().locals.push(Local {
            name: local_name,
            is_final,
            is_iterator: false,
            index: local_id,
        });
        self.consume(
            TokenKind::Semicolon,
            &format!("Expected ';' after `{diagnostic_name}` declaration"),
        );
    }

    fn const_declaration(&mut self) {
        if *self.ctx_ref().code_context_stack.last().unwrap() != CodeContext::TopLevel {
            self.error_at_previous("`const` declarations are only allowed at top level");
            return;
        }

        let exported = self.match_kind(TokenKind::Export);

        if !self.match_kind(TokenKind::Identifier) {
            self.error_at_current("Expected identifier after `const`");
            return;
        }
        let constant_name = self.previous_lexeme();

        if self.check_duplicate_constant(&constant_name) {
            self.error_at_previous("A constant with the same name already exists");
            return;
        }

        if !self.skip_type_annotation() {
            return;
        }

        if !self.match_kind(TokenKind::Equal) {
            self.error_at_current("Must assign to `const` upon declaration");
            return;
        }

        let mut negative = false;
        let value_token = if is_literal(self.current_kind()) {
            let token = self.current_token();
            self.advance();
            token
        } else if self.match_kind(TokenKind::Minus) {
            if is_number(self.current_kind()) {
                negative = true;
                let token = self.current_token();
                self.advance();
                token
            } else {
                let kind = self.current_kind();
                self.error_at_current(&format!("Cannot negate `{kind}`"));
                return;
            }
        } else {
            self.error_at_current("Expected literal value after `const` declaration");
            return;
        };

        let value = match value_token.kind {
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            TokenKind::Integer | TokenKind::HexLiteral | TokenKind::BinaryLiteral => {
                match parse_int(&value_token) {
                    Ok(parsed) => Value::Int(if negative { -parsed } else { parsed }),
                    Err(err) => {
                        self.message_at(
                            &value_token,
                            &format!("Token could not be parsed as an int: {err}"),
                            LogLevel::Error,
                        );
                        return;
                    }
                }
            }
            TokenKind::Float => match parse_float(&value_token) {
                Ok(parsed) => Value::Float(if negative { -parsed } else { parsed }),
                Err(err) => {
                    self.message_at(
                        &value_token,
                        &format!("Token could not be parsed as a float: {err}"),
                        LogLevel::Error,
                    );
                    return;
                }
            },
            TokenKind::String => match parse_string(&value_token) {
                Ok(parsed) => Value::Str(parsed),
                Err(err) => {
                    self.message_at(
                        &value_token,
                        &format!("Token could not be parsed as string: {err}"),
                        LogLevel::Error,
                    );
                    return;
                }
            },
            TokenKind::Char => match parse_char(&value_token) {
                Ok(parsed) => Value::Char(parsed),
                Err(err) => {
                    self.message_at(
                        &value_token,
                        &format!("Token could not be parsed as char: {err}"),
                        LogLevel::Error,
                    );
                    return;
                }
            },
            _ => unreachable!("const literal kinds are filtered above"),
        };

        let path = self.ctx_ref().full_path.to_string_lossy().into_owned();
        self.constants
            .entry(path)
            .or_default()
            .insert(constant_name, ConstantDef { value, exported });

        if !self.match_kind(TokenKind::Semicolon) {
            self.error_at_current("Expected ';'");
        }
    }

    // --- statements -------------------------------------------------------

    fn statement(&mut self) {
        if *self.ctx_ref().code_context_stack.last().unwrap() == CodeContext::TopLevel {
            self.error_at_current("Only functions and classes are allowed at top level");
            return;
        }

        if self.match_kind(TokenKind::For) {
            self.for_statement();
        } else if self.match_kind(TokenKind::If) {
            self.if_statement();
        } else if self.match_kind(TokenKind::Print) {
            self.print_statement(Op::Print, Op::PrintTab);
        } else if self.match_kind(TokenKind::PrintLn) {
            self.print_statement(Op::PrintLn, Op::PrintEmptyLine);
        } else if self.match_kind(TokenKind::Eprint) {
            self.print_statement(Op::EPrint, Op::EPrintTab);
        } else if self.match_kind(TokenKind::EprintLn) {
            self.print_statement(Op::EPrintLn, Op::EPrintEmptyLine);
        } else if self.match_kind(TokenKind::Return) {
            self.return_statement();
        } else if self.match_kind(TokenKind::While) {
            self.while_statement();
        } else if self.match_kind(TokenKind::Try) {
            self.try_statement();
        } else if self.match_kind(TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_kind(TokenKind::Assert) {
            self.assert_statement();
        } else if self.match_kind(TokenKind::Break) {
            self.break_statement();
        } else if self.match_kind(TokenKind::Continue) {
            self.continue_statement();
        } else if self.check(TokenKind::Catch) {
            if *self.ctx_ref().code_context_stack.last().unwrap() != CodeContext::Try {
                self.error_at_current("`catch` block only allowed after `try` block");
                self.advance();
            }
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        if is_literal(self.current_kind()) || is_operator(self.current_kind()) {
            self.error_at_current("Expected identifier or keyword at start of expression");
            self.advance();
            return;
        }
        self.expression(true);
        self.consume(TokenKind::Semicolon, "Expected ';' after expression");
    }

    fn assert_statement(&mut self) {
        let line = self.previous_line();

        self.consume(TokenKind::LeftParen, "Expected '(' after `assert`");
        self.with_expression_used(|session| session.expression(false));

        if self.match_kind(TokenKind::Comma) {
            self.consume(TokenKind::String, "Expected message");
            if self.ctx_ref().panic_mode {
                return;
            }
            let message_token = self.previous_token();
            match parse_string(&message_token) {
                Ok(message) => self.emit_const(Value::Str(message)),
                Err(err) => {
                    self.message_at(
                        &message_token,
                        &format!("Token could not be parsed as string: {err}"),
                        LogLevel::Error,
                    );
                    return;
                }
            }
            self.emit_op(Op::AssertWithMessage, line);
            self.consume(TokenKind::RightParen, "Expected ')'");
        } else {
            self.emit_op(Op::Assert, line);
            self.consume(TokenKind::RightParen, "Expected ')'");
        }

        self.consume(TokenKind::Semicolon, "Expected ';' after `assert` expression");
    }

    fn inside_loop(&self) -> bool {
        self.ctx_ref()
            .code_context_stack
            .iter()
            .rev()
            .any(|c| matches!(c, CodeContext::ForLoop | CodeContext::WhileLoop))
    }

    fn break_statement(&mut self) {
        if !self.inside_loop() {
            // Report but keep parsing so the compiler can synchronise.
            self.error_at_previous("`break` only allowed inside loops");
        }

        self.ctx().break_jump_needs_indexes = true;
        let slots = self.reserve_jump_slots();
        let line = self.previous_line();
        self.emit_op(Op::Jump, line);
        if let Some(pairs) = self.ctx().break_idx_stack.last_mut() {
            pairs.push(slots);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after `break`");
    }

    fn continue_statement(&mut self) {
        if !self.inside_loop() {
            self.error_at_previous("`continue` only allowed inside loops");
        }

        self.ctx().continue_jump_needs_indexes = true;
        let slots = self.reserve_jump_slots();
        let line = self.previous_line();
        self.emit_op(Op::Jump, line);
        if let Some(pairs) = self.ctx().continue_idx_stack.last_mut() {
            pairs.push(slots);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after `continue`");
    }

    /// Parses one `for` iterator variable, reusing an existing local when the
    /// name is already bound. Returns `(slot, needs_pop)`.
    fn parse_iterator_variable(&mut self, is_final: bool) -> Option<(i64, bool)> {
        let iterator_name = self.previous_lexeme();

        if !self.skip_type_annotation() {
            return None;
        }

        let existing = self
            .ctx_ref()
            .locals
            .iter()
            .find(|local| local.name == iterator_name)
            .map(|local| (local.index, local.is_final, local.is_iterator));

        if let Some((index, existing_final, existing_iterator)) = existing {
            if existing_final {
                self.error_at_previous(&format!(
                    "Loop variable '{iterator_name}' has already been declared as `final`"
                ));
                return None;
            }
            if existing_iterator && self.warnings_enabled() {
                self.warning_at_previous(&format!(
                    "'{iterator_name}' is an iterator variable and will be reassigned on each \
                     iteration"
                ));
                if self.options.warnings_error {
                    return None;
                }
            }
            if self.warnings_enabled() {
                self.warning_at_previous(&format!(
                    "There is already a local variable called '{iterator_name}' in this scope \
                     which will be reassigned inside the `for` loop"
                ));
                if self.options.warnings_error {
                    return None;
                }
            }
            Some((index, false))
        } else {
            if self.check_duplicate_constant(&iterator_name) {
                self.error_at_previous("A constant with the same name already exists");
                return None;
            }
            let index = self.ctx_ref().locals.len() as i64;
            self.ctx().locals.push(Local {
                name: iterator_name,
                is_final,
                is_iterator: true,
                index,
            });
            let line = self.previous_line();
            self.emit_op(Op::DeclareLocal, line);
            Some((index, true))
        }
    }

    fn for_statement(&mut self) {
        self.ctx().code_context_stack.push(CodeContext::ForLoop);
        self.ctx().break_idx_stack.push(Vec::new());
        self.ctx().continue_idx_stack.push(Vec::new());

        let first_is_final = self.match_kind(TokenKind::Final);
        self.consume(TokenKind::Identifier, "Expected identifier after `for`");
        if self.ctx_ref().panic_mode {
            return;
        }
        let Some((iterator_id, iterator_needs_pop)) = self.parse_iterator_variable(first_is_final)
        else {
            return;
        };

        let mut two_iterators = false;
        let mut second_iterator_id = 0i64;
        let mut second_needs_pop = false;
        if self.match_kind(TokenKind::Comma) {
            two_iterators = true;
            let second_is_final = self.match_kind(TokenKind::Final);
            if !self.match_kind(TokenKind::Identifier) {
                self.error_at_current("Expected identifier");
                return;
            }
            let Some((id, needs_pop)) = self.parse_iterator_variable(second_is_final) else {
                return;
            };
            second_iterator_id = id;
            second_needs_pop = needs_pop;
        }

        let num_locals_start = self.ctx_ref().locals.len();

        self.consume(TokenKind::In, "Expected `in` after identifier");
        self.with_expression_used(|session| session.expression(false));
        self.consume(TokenKind::Colon, "Expected ':' after `for` statement");

        let line = self.previous_line();

        self.emit_const(Value::Bool(two_iterators));
        self.emit_const_int(iterator_id);
        self.emit_const_int(second_iterator_id);
        self.emit_op(Op::AssignIteratorBegin, line);

        // Loop header: each iteration re-evaluates the end condition.
        let start_constant_idx = self.builder.num_constants() as i64;
        let start_op_idx = self.builder.num_ops() as i64;

        self.emit_op(Op::CheckIteratorEnd, line);

        let end_jump_slots = self.reserve_jump_slots();
        self.emit_op(Op::JumpIfFalse, line);

        while !self.match_kind(TokenKind::End) {
            self.declaration();
            if self.had_error {
                return;
            }
            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated `for`");
                return;
            }
        }

        // `continue` lands here so the iterator still advances.
        if self.ctx_ref().continue_jump_needs_indexes {
            let pairs = self.ctx().continue_idx_stack.pop().unwrap_or_default();
            for slots in pairs {
                self.patch_jump_to_here(slots);
            }
            self.ctx().continue_jump_needs_indexes =
                !self.ctx_ref().continue_idx_stack.is_empty();
        } else {
            self.ctx().continue_idx_stack.pop();
        }

        if self.ctx_ref().locals.len() != num_locals_start {
            self.emit_const_int(num_locals_start as i64);
            self.emit_op(Op::PopLocals, line);
        }

        self.emit_const(Value::Bool(two_iterators));
        self.emit_const_int(iterator_id);
        self.emit_const_int(second_iterator_id);
        self.emit_op(Op::IncrementIterator, line);

        self.emit_const_int(start_constant_idx);
        self.emit_const_int(start_op_idx);
        self.emit_op(Op::Jump, line);

        if self.ctx_ref().break_jump_needs_indexes {
            let pairs = self.ctx().break_idx_stack.pop().unwrap_or_default();
            for slots in pairs {
                self.patch_jump_to_here(slots);
            }
            self.ctx().break_jump_needs_indexes = !self.ctx_ref().break_idx_stack.is_empty();
        } else {
            self.ctx().break_idx_stack.pop();
        }

        self.patch_jump_to_here(end_jump_slots);

        if self.ctx_ref().locals.len() != num_locals_start {
            self.emit_const_int(num_locals_start as i64);
            self.emit_op(Op::PopLocals, line);
        }
        while self.ctx_ref().locals.len() != num_locals_start {
            self.ctx().locals.pop();
        }

        if two_iterators && second_needs_pop {
            self.ctx().locals.pop();
            self.emit_op(Op::PopLocal, line);
        }
        if iterator_needs_pop {
            self.ctx().locals.pop();
            self.emit_op(Op::PopLocal, line);
        }

        self.emit_op(Op::DestroyHeldIterator, line);

        self.ctx().code_context_stack.pop();
    }

    fn if_statement(&mut self) {
        self.ctx().code_context_stack.push(CodeContext::If);

        self.with_expression_used(|session| session.expression(false));
        self.consume(TokenKind::Colon, "Expected ':' after condition");

        let top_jump_slots = self.reserve_jump_slots();
        let line = self.previous_line();
        self.emit_op(Op::JumpIfFalse, line);

        let mut end_jump_slot_pairs: Vec<(usize, usize)> = Vec::new();
        let num_locals_start = self.ctx_ref().locals.len();

        let mut top_jump_set = false;
        let mut else_block_found = false;
        let mut else_if_block_found = false;
        let mut needs_else_block = true;
        loop {
            if needs_else_block && self.match_kind(TokenKind::End) {
                break;
            }

            if self.match_kind(TokenKind::Else) {
                if else_block_found {
                    self.error_at_previous("Unreachable `else` due to previous `else`");
                    return;
                }

                // The branch's own locals end with the branch.
                if self.ctx_ref().locals.len() != num_locals_start {
                    let line = self.previous_line();
                    self.emit_const_int(num_locals_start as i64);
                    self.emit_op(Op::PopLocals, line);
                }
                while self.ctx_ref().locals.len() != num_locals_start {
                    self.ctx().locals.pop();
                }

                // The taken `if` branch jumps over the `else` body.
                let end_slots = self.reserve_jump_slots();
                let line = self.previous_line();
                self.emit_op(Op::Jump, line);
                end_jump_slot_pairs.push(end_slots);

                if !top_jump_set {
                    self.patch_jump_to_here(top_jump_slots);
                    top_jump_set = true;
                }

                if self.match_kind(TokenKind::Colon) {
                    else_block_found = true;
                    if self.match_kind(TokenKind::End) {
                        break;
                    }
                } else if self.check(TokenKind::If) {
                    else_if_block_found = true;
                    needs_else_block = false;
                } else {
                    self.error_at_current("Expected `if` or `:` after `else`");
                    return;
                }
            }

            self.declaration();
            if self.had_error {
                return;
            }

            if else_if_block_found {
                break;
            }

            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated `if` statement");
                return;
            }
        }

        for slots in end_jump_slot_pairs {
            self.patch_jump_to_here(slots);
        }
        if !top_jump_set {
            self.patch_jump_to_here(top_jump_slots);
        }

        if self.ctx_ref().locals.len() != num_locals_start {
            let line = self.previous_line();
            self.emit_const_int(num_locals_start as i64);
            self.emit_op(Op::PopLocals, line);
            while self.ctx_ref().locals.len() != num_locals_start {
                self.ctx().locals.pop();
            }
        }

        self.ctx().code_context_stack.pop();
    }

    fn print_statement(&mut self, print_op: Op, empty_op: Op) {
        self.consume(TokenKind::LeftParen, "Expected '(' after print statement");
        if self.match_kind(TokenKind::RightParen) {
            let line = self.current_line();
            self.emit_op(empty_op, line);
        } else {
            self.with_expression_used(|session| session.expression(false));
            let line = self.current_line();
            self.emit_op(print_op, line);
            self.consume(TokenKind::RightParen, "Expected ')' after expression");
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after expression");
    }

    fn return_statement(&mut self) {
        if !self
            .ctx_ref()
            .code_context_stack
            .iter()
            .any(|c| *c == CodeContext::Function)
        {
            self.error_at_previous("`return` only allowed inside functions");
            return;
        }

        if self.builder.current_function_name() == "main" {
            self.error_at_previous("Cannot return from main function");
            return;
        }

        if self.match_kind(TokenKind::Semicolon) {
            let line = self.previous_line();
            self.emit_const(Value::Null);
            self.emit_op(Op::LoadConstant, line);
            self.emit_op(Op::Return, line);
            return;
        }

        self.with_expression_used(|session| session.expression(false));

        // This may be an early return, so the compiler's local list must
        // stay intact; the VM still unwinds the frame's locals here while
        // the expression result is safely on the value stack.
        if !self.ctx_ref().locals.is_empty() {
            let line = self.previous_line();
            self.emit_const_int(0);
            self.emit_op(Op::PopLocals, line);
        }

        let line = self.previous_line();
        self.emit_op(Op::Return, line);
        self.consume(TokenKind::Semicolon, "Expected ';' after expression");
    }

    fn try_statement(&mut self) {
        self.ctx().code_context_stack.push(CodeContext::Try);

        self.consume(TokenKind::Colon, "Expected `:` after `try`");

        let mut num_locals_start = self.ctx_ref().locals.len();

        let catch_jump_slots = self.reserve_jump_slots();
        let line = self.previous_line();
        self.emit_op(Op::EnterTry, line);

        while !self.match_kind(TokenKind::Catch) {
            self.declaration();
            if self.had_error {
                return;
            }
            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated `try` block");
                return;
            }
        }

        // Clean exit: discard the snapshot, pop try-scoped locals, skip the
        // catch block.
        let line = self.previous_line();
        self.emit_const_int(num_locals_start as i64);
        self.emit_op(Op::ExitTry, line);

        let skip_catch_slots = self.reserve_jump_slots();
        self.emit_op(Op::Jump, line);

        // The exception path lands here with the thrown value on the stack.
        self.patch_jump_to_here(catch_jump_slots);
        self.emit_const_int(num_locals_start as i64);
        self.emit_op(Op::ExitTry, line);

        if !self.match_kind(TokenKind::Identifier) {
            self.error_at_current("Expected identifier after `catch`");
            return;
        }

        while self.ctx_ref().locals.len() != num_locals_start {
            self.ctx().locals.pop();
        }
        num_locals_start = self.ctx_ref().locals.len();

        let exception_var_name = self.previous_lexeme();
        let existing = self
            .ctx_ref()
            .locals
            .iter()
            .find(|local| local.name == exception_var_name)
            .map(|local| (local.index, local.is_final, local.is_iterator));
        let exception_var_id = if let Some((index, is_final, is_iterator)) = existing {
            if is_final {
                self.error_at_previous(&format!(
                    "Exception variable '{exception_var_name}' has already been declared as `final`"
                ));
                return;
            }
            if is_iterator && self.warnings_enabled() {
                self.warning_at_previous(&format!(
                    "'{exception_var_name}' is an iterator variable and will be reassigned on \
                     each loop iteration"
                ));
                if self.options.warnings_error {
                    return;
                }
            }
            if self.warnings_enabled() {
                self.warning_at_previous(&format!(
                    "There is already a local variable called '{exception_var_name}' in this \
                     scope which will be reassigned inside the `catch` block"
                ));
                if self.options.warnings_error {
                    return;
                }
            }
            index
        } else {
            if self.check_duplicate_constant(&exception_var_name) {
                self.error_at_previous("A constant with the same name already exists");
                return;
            }
            let index = self.ctx_ref().locals.len() as i64;
            self.ctx().locals.push(Local {
                name: exception_var_name,
                is_final: false,
                is_iterator: false,
                index,
            });
            let line = self.previous_line();
            self.emit_op(Op::DeclareLocal, line);
            index
        };

        let line = self.previous_line();
        self.emit_const_int(exception_var_id);
        self.emit_op(Op::AssignLocal, line);

        self.consume(TokenKind::Colon, "Expected `:` after `catch` statement");

        self.ctx().code_context_stack.pop();
        self.ctx().code_context_stack.push(CodeContext::Catch);

        while !self.match_kind(TokenKind::End) {
            self.declaration();
            if self.had_error {
                return;
            }
            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated `catch` block");
                return;
            }
        }

        if self.ctx_ref().locals.len() != num_locals_start {
            let line = self.previous_line();
            self.emit_const_int(num_locals_start as i64);
            self.emit_op(Op::PopLocals, line);
            while self.ctx_ref().locals.len() != num_locals_start {
                self.ctx().locals.pop();
            }
        }

        self.patch_jump_to_here(skip_catch_slots);

        self.ctx().code_context_stack.pop();
    }

    fn throw_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after `throw`");
        self.with_expression_used(|session| session.expression(false));
        let line = self.previous_line();
        self.emit_op(Op::Throw, line);
        self.consume(TokenKind::RightParen, "Expected ')' after `throw` message");
        self.consume(TokenKind::Semicolon, "Expected ';' after `throw` statement");
    }

    fn while_statement(&mut self) {
        self.ctx().code_context_stack.push(CodeContext::WhileLoop);
        self.ctx().break_idx_stack.push(Vec::new());
        self.ctx().continue_idx_stack.push(Vec::new());

        let constant_idx = self.builder.num_constants() as i64;
        let op_idx = self.builder.num_ops() as i64;

        self.with_expression_used(|session| session.expression(false));

        let line = self.previous_line();

        let end_jump_slots = self.reserve_jump_slots();
        self.emit_op(Op::JumpIfFalse, line);

        self.consume(TokenKind::Colon, "Expected ':' after expression");

        let num_locals_start = self.ctx_ref().locals.len();

        while !self.match_kind(TokenKind::End) {
            self.declaration();
            if self.had_error {
                return;
            }
            if self.match_kind(TokenKind::EndOfFile) {
                self.error_at_previous("Unterminated `while` loop");
                return;
            }
        }

        if self.ctx_ref().continue_jump_needs_indexes {
            let pairs = self.ctx().continue_idx_stack.pop().unwrap_or_default();
            for slots in pairs {
                self.patch_jump_to_here(slots);
            }
            self.ctx().continue_jump_needs_indexes =
                !self.ctx_ref().continue_idx_stack.is_empty();
        } else {
            self.ctx().continue_idx_stack.pop();
        }

        if self.ctx_ref().locals.len() != num_locals_start {
            self.emit_const_int(num_locals_start as i64);
            self.emit_op(Op::PopLocals, line);
        }

        // Back to the condition for re-evaluation.
        self.emit_const_int(constant_idx);
        self.emit_const_int(op_idx);
        self.emit_op(Op::Jump, line);

        if self.ctx_ref().break_jump_needs_indexes {
            let pairs = self.ctx().break_idx_stack.pop().unwrap_or_default();
            for slots in pairs {
                self.patch_jump_to_here(slots);
            }
            self.ctx().break_jump_needs_indexes = !self.ctx_ref().break_idx_stack.is_empty();

            // A `break` skips the loop-tail PopLocals, so emit another one
            // on the break path.
            if self.ctx_ref().locals.len() != num_locals_start {
                self.emit_const_int(num_locals_start as i64);
                self.emit_op(Op::PopLocals, line);
            }
        } else {
            self.ctx().break_idx_stack.pop();
        }

        while self.ctx_ref().locals.len() != num_locals_start {
            self.ctx().locals.pop();
        }

        self.patch_jump_to_here(end_jump_slots);

        self.ctx().code_context_stack.pop();
    }

    // --- expressions ------------------------------------------------------

    fn expression(&mut self, can_assign: bool) {
        if is_operator(self.current_kind()) {
            self.error_at_current("Expected identifier or literal at start of expression");
            self.advance();
            return;
        }
        if let Some(keyword) = keyword_spelling(self.current_kind()) {
            self.error_at_current(&format!(
                "'{keyword}' is a keyword and not valid in this context"
            ));
            self.advance();
            return;
        }

        if self.check(TokenKind::Identifier) {
            self.call(can_assign);

            if self.check(TokenKind::Equal) || is_compound_assignment(self.current_kind()) {
                if self.previous_kind() != TokenKind::Identifier {
                    self.error_at_current("Only identifiers can be assigned to");
                    return;
                }

                let local_name = self.previous_lexeme();
                let found = self
                    .ctx_ref()
                    .locals
                    .iter()
                    .find(|local| local.name == local_name)
                    .map(|local| (local.index, local.is_final, local.is_iterator));
                let Some((index, is_final, is_iterator)) = found else {
                    let suggestion = self.most_similar_local(&local_name);
                    if let Some(suggestion) = suggestion {
                        self.error_at_previous(&format!(
                            "Cannot find variable '{local_name}' in this scope, did you mean \
                             '{suggestion}'?"
                        ));
                    } else {
                        self.error_at_previous(&format!(
                            "Cannot find variable '{local_name}' in this scope"
                        ));
                    }
                    return;
                };

                if is_final {
                    self.error_at_previous(&format!("Cannot reassign to final '{local_name}'"));
                    return;
                }
                if is_iterator && self.warnings_enabled() {
                    self.warning_at_previous(&format!(
                        "'{local_name}' is an iterator variable and will be reassigned on each \
                         loop iteration"
                    ));
                    if self.options.warnings_error {
                        return;
                    }
                }
                if !can_assign {
                    self.error_at_current("Assignment is not valid in the current context");
                    return;
                }

                self.advance();
                let op_kind = self.previous_kind();

                // Right-associative in grammar, but chained assignment is
                // rejected: the right-hand side parses with assignment off.
                self.with_expression_used(|session| session.expression(false));

                self.emit_const_int(index);
                let line = self.previous_line();
                let op = match op_kind {
                    TokenKind::Equal => Op::AssignLocal,
                    TokenKind::PlusEquals => Op::AddAssign,
                    TokenKind::MinusEquals => Op::SubtractAssign,
                    TokenKind::StarEquals => Op::MultiplyAssign,
                    TokenKind::SlashEquals => Op::DivideAssign,
                    TokenKind::AmpersandEquals => Op::BitwiseAndAssign,
                    TokenKind::CaretEquals => Op::BitwiseXOrAssign,
                    TokenKind::BarEquals => Op::BitwiseOrAssign,
                    TokenKind::ModEquals => Op::ModAssign,
                    TokenKind::ShiftLeftEquals => Op::ShiftLeftAssign,
                    TokenKind::ShiftRightEquals => Op::ShiftRightAssign,
                    TokenKind::StarStarEquals => Op::PowAssign,
                    _ => unreachable!("assignment kinds are filtered above"),
                };
                self.emit_op(op, line);
            } else {
                // Not an assignment; continue the expression from whatever
                // operator follows the call chain.
                loop {
                    match self.current_kind() {
                        TokenKind::Bar => self.bitwise_or(false, true),
                        TokenKind::Ampersand => self.bitwise_and(false, true),
                        TokenKind::Caret => self.bitwise_xor(false, true),
                        TokenKind::And => self.and(false, true),
                        TokenKind::Or => self.or(false, true),
                        TokenKind::EqualEqual | TokenKind::BangEqual => self.equality(false, true),
                        TokenKind::GreaterThan
                        | TokenKind::GreaterEqual
                        | TokenKind::LessThan
                        | TokenKind::LessEqual => self.comparison(false, true),
                        TokenKind::Plus | TokenKind::Minus => self.term(false, true),
                        TokenKind::Star
                        | TokenKind::StarStar
                        | TokenKind::Slash
                        | TokenKind::Mod => self.factor(false, true),
                        TokenKind::ShiftLeft | TokenKind::ShiftRight => self.shift(false, true),
                        TokenKind::Semicolon
                        | TokenKind::RightParen
                        | TokenKind::Comma
                        | TokenKind::Colon
                        | TokenKind::In
                        | TokenKind::RightSquareParen
                        | TokenKind::LeftCurlyParen
                        | TokenKind::RightCurlyParen
                        | TokenKind::DotDot
                        | TokenKind::By => break,
                        TokenKind::Dot => {
                            self.advance();
                            self.dot(can_assign);
                        }
                        TokenKind::LeftSquareParen => {
                            self.advance();
                            self.subscript(can_assign);
                        }
                        _ => {
                            self.error_at_current("Invalid token found in expression");
                            self.advance();
                            return;
                        }
                    }
                    if self.ctx_ref().panic_mode {
                        return;
                    }
                }
            }
        } else {
            self.or(can_assign, false);
        }
    }

    fn most_similar_local(&self, name: &str) -> Option<String> {
        let mut best: Option<(usize, &str)> = None;
        for local in &self.ctx_ref().locals {
            if local.name == "__ARGS" {
                continue;
            }
            let distance = edit_distance(name, &local.name);
            if best.is_none_or(|(current, _)| distance < current) {
                best = Some((distance, &local.name));
            }
        }
        best.map(|(_, name)| name.to_owned())
    }

    fn or(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.and(can_assign, false);
        }
        while self.match_kind(TokenKind::Or) {
            self.and(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::Or, line);
        }
    }

    fn and(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.bitwise_or(can_assign, false);
        }
        while self.match_kind(TokenKind::And) {
            self.bitwise_or(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::And, line);
        }
    }

    fn bitwise_or(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.bitwise_xor(can_assign, false);
        }
        while self.match_kind(TokenKind::Bar) {
            self.bitwise_xor(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::BitwiseOr, line);
        }
    }

    fn bitwise_xor(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.bitwise_and(can_assign, false);
        }
        while self.match_kind(TokenKind::Caret) {
            self.bitwise_and(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::BitwiseXOr, line);
        }
    }

    fn bitwise_and(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.equality(can_assign, false);
        }
        while self.match_kind(TokenKind::Ampersand) {
            self.equality(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::BitwiseAnd, line);
        }
    }

    fn equality(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.comparison(can_assign, false);
        }
        if self.match_kind(TokenKind::EqualEqual) {
            self.comparison(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::Equal, line);
        } else if self.match_kind(TokenKind::BangEqual) {
            self.comparison(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::NotEqual, line);
        }
    }

    fn comparison(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.shift(can_assign, false);
        }
        if self.match_kind(TokenKind::GreaterThan) {
            self.shift(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::Greater, line);
        } else if self.match_kind(TokenKind::GreaterEqual) {
            self.shift(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::GreaterEqual, line);
        } else if self.match_kind(TokenKind::LessThan) {
            self.shift(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::Less, line);
        } else if self.match_kind(TokenKind::LessEqual) {
            self.shift(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::LessEqual, line);
        }
    }

    fn shift(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.term(can_assign, false);
        }
        if self.match_kind(TokenKind::ShiftRight) {
            self.term(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::ShiftRight, line);
        } else if self.match_kind(TokenKind::ShiftLeft) {
            self.term(can_assign, false);
            let line = self.current_line();
            self.emit_op(Op::ShiftLeft, line);
        }
    }

    fn term(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.factor(can_assign, false);
        }
        loop {
            if self.match_kind(TokenKind::Minus) {
                self.factor(can_assign, false);
                let line = self.current_line();
                self.emit_op(Op::Subtract, line);
            } else if self.match_kind(TokenKind::Plus) {
                self.factor(can_assign, false);
                let line = self.current_line();
                self.emit_op(Op::Add, line);
            } else {
                return;
            }
        }
    }

    fn factor(&mut self, can_assign: bool, skip_first: bool) {
        if !skip_first {
            self.unary(can_assign);
        }
        loop {
            if self.match_kind(TokenKind::StarStar) {
                self.unary(can_assign);
                let line = self.current_line();
                self.emit_op(Op::Pow, line);
            } else if self.match_kind(TokenKind::Star) {
                self.unary(can_assign);
                let line = self.current_line();
                self.emit_op(Op::Multiply, line);
            } else if self.match_kind(TokenKind::Slash) {
                self.unary(can_assign);
                let line = self.current_line();
                self.emit_op(Op::Divide, line);
            } else if self.match_kind(TokenKind::Mod) {
                self.unary(can_assign);
                let line = self.current_line();
                self.emit_op(Op::Mod, line);
            } else {
                return;
            }
        }
    }

    fn unary(&mut self, can_assign: bool) {
        if self.match_kind(TokenKind::Bang) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::Not, line);
        } else if self.match_kind(TokenKind::Minus) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::Negate, line);
        } else if self.match_kind(TokenKind::Tilde) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::BitwiseNot, line);
        } else {
            self.call(can_assign);
        }
    }

    fn call(&mut self, can_assign: bool) {
        self.primary(can_assign);
    }

    fn primary(&mut self, can_assign: bool) {
        if self.match_kind(TokenKind::True) {
            let line = self.previous_line();
            self.emit_op(Op::LoadConstant, line);
            self.emit_const(Value::Bool(true));
        } else if self.match_kind(TokenKind::False) {
            let line = self.previous_line();
            self.emit_op(Op::LoadConstant, line);
            self.emit_const(Value::Bool(false));
        } else if self.match_kind(TokenKind::Integer)
            || self.match_kind(TokenKind::HexLiteral)
            || self.match_kind(TokenKind::BinaryLiteral)
        {
            let token = self.previous_token();
            match parse_int(&token) {
                Ok(value) => {
                    self.emit_op(Op::LoadConstant, token.line);
                    self.emit_const(Value::Int(value));
                }
                Err(err) => {
                    self.message_at(
                        &token,
                        &format!("Token could not be parsed as an int: {err}"),
                        LogLevel::Error,
                    );
                }
            }
        } else if self.match_kind(TokenKind::Float) {
            let token = self.previous_token();
            match parse_float(&token) {
                Ok(value) => {
                    self.emit_op(Op::LoadConstant, token.line);
                    self.emit_const(Value::Float(value));
                }
                Err(err) => {
                    self.message_at(
                        &token,
                        &format!("Token could not be parsed as a float: {err}"),
                        LogLevel::Error,
                    );
                }
            }
        } else if self.match_kind(TokenKind::String) {
            self.string_literal();
        } else if self.match_kind(TokenKind::Char) {
            self.char_literal();
        } else if self.match_kind(TokenKind::Identifier) {
            self.identifier(can_assign);
        } else if self.match_kind(TokenKind::Null) {
            let line = self.previous_line();
            self.emit_const(Value::Null);
            self.emit_op(Op::LoadConstant, line);
        } else if self.match_kind(TokenKind::LeftParen) {
            self.expression(can_assign);
            self.consume(TokenKind::RightParen, "Expected ')'");
        } else if self.match_kind(TokenKind::InstanceOf) {
            self.instance_of();
        } else if self.match_kind(TokenKind::IsObject) {
            self.is_object();
        } else if is_type_ident(self.current_kind()) {
            self.cast();
        } else if self.match_kind(TokenKind::LeftSquareParen) {
            self.list_literal();
        } else if self.match_kind(TokenKind::LeftCurlyParen) {
            self.dictionary_literal();
        } else if self.match_kind(TokenKind::Typename) {
            self.typename();
        } else if self.match_kind(TokenKind::This) {
            self.error_at_previous("`this` is only valid in an extension method parameter list");
        } else {
            self.error_at_current("Expected expression");
            self.advance();
        }

        loop {
            if self.match_kind(TokenKind::Dot) {
                self.dot(can_assign);
            } else if self.match_kind(TokenKind::LeftSquareParen) {
                self.subscript(can_assign);
            } else {
                break;
            }
            if self.ctx_ref().panic_mode {
                return;
            }
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.with_expression_used(|session| session.expression(false));

        if !self.match_kind(TokenKind::RightSquareParen) {
            self.error_at_current("Expected ']' after subscript expression");
            return;
        }

        if self.match_kind(TokenKind::Equal) {
            if !can_assign {
                self.error_at_previous("Assignment is not valid in the current context");
                return;
            }
            self.with_expression_used(|session| session.expression(false));
            let line = self.previous_line();
            self.emit_op(Op::AssignSubscript, line);
        } else {
            let line = self.previous_line();
            self.emit_op(Op::GetSubscript, line);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        if !self.match_kind(TokenKind::Identifier) {
            self.error_at_current("Expected identifier after '.'");
            return;
        }
        let member_name_token = self.previous_token();

        if self.match_kind(TokenKind::LeftParen) {
            self.dot_function_call(&member_name_token);
        } else if self.match_kind(TokenKind::Equal) {
            if !can_assign {
                self.error_at_previous("Assignment is not valid here");
                return;
            }
            self.with_expression_used(|session| session.expression(false));
            self.emit_const(Value::Str(member_name_token.lexeme));
            let line = self.previous_line();
            self.emit_op(Op::AssignMember, line);
        } else {
            self.emit_const(Value::Str(member_name_token.lexeme.clone()));
            self.emit_op(Op::LoadMember, member_name_token.line);
        }
    }

    /// Parses `(arg, arg, ...)` after the opening paren, returning the count.
    fn parse_call_parameters(&mut self) -> Option<i64> {
        let mut num_args = 0i64;
        if !self.match_kind(TokenKind::RightParen) {
            loop {
                self.with_expression_used(|session| session.expression(false));
                num_args += 1;
                if self.match_kind(TokenKind::RightParen) {
                    break;
                }
                if !self.match_kind(TokenKind::Comma) {
                    self.error_at_current("Expected ',' after function call argument");
                    return None;
                }
            }
        }
        Some(num_args)
    }

    fn dot_function_call(&mut self, func_name_token: &Token) {
        let Some(num_args) = self.parse_call_parameters() else {
            return;
        };

        let func_name = func_name_token.lexeme.clone();
        let hash = name_hash(&func_name);
        self.emit_const(Value::Str(func_name));
        self.emit_const_hash(hash);
        self.emit_const_int(num_args);
        self.emit_op(Op::MemberCall, func_name_token.line);

        self.pop_unused_expression_result();
    }

    fn free_function_call(&mut self, func_name_token: &Token) {
        self.ctx().namespace_qualifier_used = true;

        let func_name = func_name_token.lexeme.clone();
        let is_native = func_name.starts_with("__");
        let native = if is_native {
            let Some(native) = natives::lookup(&func_name) else {
                self.message_at(
                    func_name_token,
                    &format!(
                        "No native function matching the given signature `{func_name}` was found"
                    ),
                    LogLevel::Error,
                );
                return;
            };
            Some(native)
        } else {
            None
        };

        let Some(num_args) = self.parse_call_parameters() else {
            return;
        };

        if let Some((_, arity)) = native
            && num_args != arity as i64
        {
            self.error_at_previous(&format!(
                "Incorrect number of arguments given to native call - got {num_args} but \
                 expected {arity}"
            ));
            return;
        }

        // Allowing calls to `main` would re-run the Exit epilogue mid
        // program; it is rejected in every file.
        if func_name == "main" {
            self.message_at(func_name_token, "Cannot call the `main` function", LogLevel::Error);
            return;
        }

        let line = self.previous_line();
        if let Some((index, _)) = native {
            self.emit_const_int(index as i64);
            self.emit_const_int(num_args);
            self.emit_op(Op::NativeCall, line);
        } else {
            self.emit_const_hash(name_hash(&func_name));
            self.emit_const_int(num_args);
            self.emit_const(Value::Str(func_name));
            self.emit_op(Op::Call, line);
        }

        self.pop_unused_expression_result();
    }

    fn identifier(&mut self, can_assign: bool) {
        let prev = self.previous_token();
        let prev_text = prev.lexeme.clone();

        if self.match_kind(TokenKind::LeftParen) {
            self.free_function_call(&prev);
        } else if self.match_kind(TokenKind::ColonColon) {
            if !self.check(TokenKind::Identifier) {
                self.error_at_current("Expected identifier after `::`");
                return;
            }

            if !self.ctx_ref().current_namespace_lookup.is_empty() {
                self.ctx().current_namespace_lookup.push('/');
            }
            if self.ctx_ref().namespace_qualifier_used {
                self.emit_op(Op::StartNewNamespace, prev.line);
                self.ctx().namespace_qualifier_used = false;
                self.ctx().current_namespace_lookup.clear();
            }

            self.emit_const(Value::Str(prev_text.clone()));
            self.emit_const_hash(name_hash(&prev_text));
            self.emit_op(Op::AppendNamespace, prev.line);

            self.ctx().current_namespace_lookup.push_str(&prev_text);

            self.expression(can_assign);
        } else if !self.check(TokenKind::Equal) && !is_compound_assignment(self.current_kind()) {
            // A bare identifier: load the local, or substitute the constant
            // inline. Assignments are handled by the caller.
            let local_index = self
                .ctx_ref()
                .locals
                .iter()
                .find(|local| local.name == prev_text)
                .map(|local| local.index);

            if let Some(index) = local_index {
                self.emit_const_int(index);
                self.emit_op(Op::LoadLocal, prev.line);
                return;
            }

            let path = self.ctx_ref().full_path.to_string_lossy().into_owned();
            let local_constant = self
                .constants
                .get(&path)
                .and_then(|file| file.get(&prev_text))
                .map(|def| def.value.clone_primitive());
            if let Some(value) = local_constant {
                self.emit_const(value);
                self.emit_op(Op::LoadConstant, prev.line);
                return;
            }

            // Maybe a constant reached through the namespace qualifier that
            // has been accumulating.
            let import_path = self
                .ctx_ref()
                .parent_path
                .join(format!("{}.gr", self.ctx_ref().current_namespace_lookup));
            let import_path = std::path::absolute(&import_path).unwrap_or(import_path);
            let import_key = import_path
                .canonicalize()
                .unwrap_or(import_path)
                .to_string_lossy()
                .into_owned();
            let imported = self
                .constants
                .get(&import_key)
                .and_then(|file| file.get(&prev_text))
                .map(|def| (def.value.clone_primitive(), def.exported));

            if let Some((value, exported)) = imported {
                if !exported {
                    self.error_at_previous(&format!(
                        "Constant '{prev_text}' has not been exported"
                    ));
                    return;
                }
                self.ctx().namespace_qualifier_used = true;
                self.emit_const(value);
                self.emit_op(Op::LoadConstant, prev.line);
                // The qualifier ops already ran; reset the accumulator so the
                // next unqualified call resolves in the current file.
                self.emit_op(Op::StartNewNamespace, prev.line);
            } else if let Some(suggestion) = self.most_similar_local(&prev_text) {
                self.error_at_previous(&format!(
                    "Cannot find variable '{prev_text}' in this scope, did you mean \
                     '{suggestion}'?"
                ));
            } else {
                self.error_at_previous(&format!(
                    "Cannot find variable '{prev_text}' in this scope"
                ));
            }
        }
    }

    fn char_literal(&mut self) {
        let token = self.previous_token();
        match parse_char(&token) {
            Ok(value) => {
                self.emit_op(Op::LoadConstant, token.line);
                self.emit_const(Value::Char(value));
            }
            Err(err) => {
                self.message_at(
                    &token,
                    &format!("Token could not be parsed as char: {err}"),
                    LogLevel::Error,
                );
            }
        }
    }

    fn string_literal(&mut self) {
        let token = self.previous_token();
        match parse_string(&token) {
            Ok(value) => {
                self.emit_op(Op::LoadConstant, token.line);
                self.emit_const(Value::Str(value));
            }
            Err(err) => {
                self.message_at(
                    &token,
                    &format!("Token could not be parsed as string: {err}"),
                    LogLevel::Error,
                );
            }
        }
    }

    fn instance_of(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'instanceof'");

        self.with_expression_used(|session| session.expression(false));

        self.consume(TokenKind::Comma, "Expected ',' after expression");

        let tag = match self.current_kind() {
            TokenKind::BoolIdent => 0,
            TokenKind::CharIdent => 1,
            TokenKind::FloatIdent => 2,
            TokenKind::IntIdent => 3,
            TokenKind::Null => 4,
            TokenKind::StringIdent => 5,
            TokenKind::ListIdent => 6,
            TokenKind::DictIdent => 7,
            TokenKind::ExceptionIdent => 8,
            TokenKind::KeyValuePairIdent => 9,
            TokenKind::SetIdent => 10,
            TokenKind::Identifier => 11,
            _ => {
                self.error_at_current("Expected type as second argument for `instanceof`");
                return;
            }
        };
        self.emit_const_int(tag);
        if tag == 4 && self.warnings_enabled() {
            self.warning_at_current("Prefer comparison `== null` over `instanceof` call for `null` check");
            if self.options.warnings_error {
                return;
            }
        }
        if tag == 11 {
            self.emit_const(Value::Str(self.current_token().lexeme));
        }

        let line = self.current_line();
        self.emit_op(Op::CheckType, line);

        self.advance();
        self.consume(TokenKind::RightParen, "Expected ')'");

        self.pop_unused_expression_result();
    }

    fn is_object(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after `isobject`");
        self.with_expression_used(|session| session.expression(false));
        let line = self.previous_line();
        self.emit_op(Op::IsObject, line);
        self.consume(TokenKind::RightParen, "Expected ')' after expression");

        self.pop_unused_expression_result();
    }

    fn cast(&mut self) {
        let type_token = self.current_token();
        self.advance();
        self.consume(TokenKind::LeftParen, "Expected '(' after type ident");

        let mut is_list = false;
        let mut is_set = false;
        let mut num_items = 0i64;

        match type_token.kind {
            // These construct the value from a single expression; Exception
            // converts the expression to its message string.
            TokenKind::IntIdent
            | TokenKind::FloatIdent
            | TokenKind::BoolIdent
            | TokenKind::StringIdent
            | TokenKind::CharIdent
            | TokenKind::ExceptionIdent => {
                self.with_expression_used(|session| session.expression(false));
                let tag = match type_token.kind {
                    TokenKind::IntIdent => 0,
                    TokenKind::FloatIdent => 1,
                    TokenKind::BoolIdent => 2,
                    TokenKind::StringIdent => 3,
                    TokenKind::CharIdent => 4,
                    _ => 5,
                };
                self.emit_const_int(tag);
                let line = self.current_line();
                self.emit_op(Op::Cast, line);
            }
            TokenKind::KeyValuePairIdent => {
                self.with_expression_used(|session| {
                    session.expression(false);
                    session.consume(
                        TokenKind::Comma,
                        "Expected ',' between key and value in `KeyValuePair` constructor",
                    );
                    session.expression(false);
                });
                self.emit_const_int(6);
                let line = self.current_line();
                self.emit_op(Op::Cast, line);
            }
            TokenKind::ListIdent | TokenKind::SetIdent => {
                if type_token.kind == TokenKind::ListIdent {
                    is_list = true;
                } else {
                    is_set = true;
                }
                let prev = self.ctx_ref().using_expression_result;
                self.ctx().using_expression_result = true;
                loop {
                    if self.check(TokenKind::RightParen) {
                        break;
                    }
                    if self.match_kind(TokenKind::EndOfFile) {
                        let name = if is_list { "List" } else { "Set" };
                        self.error_at_previous(&format!("Unterminated `{name}` constructor"));
                        return;
                    }
                    self.expression(false);
                    num_items += 1;
                    if self.check(TokenKind::RightParen) {
                        break;
                    }
                    if !self.match_kind(TokenKind::Comma) {
                        let name = if is_list { "List" } else { "Set" };
                        self.error_at_previous(&format!("Expected ',' between `{name}` items"));
                        return;
                    }
                }
                self.ctx().using_expression_result = prev;
            }
            TokenKind::DictIdent => {
                self.message_at(
                    &type_token,
                    "Cannot use `Dict` like a constructor, use literal expression `{ key: value, \
                     ... }`",
                    LogLevel::Error,
                );
                return;
            }
            _ => unreachable!("cast is only entered on type identifiers"),
        }

        self.consume(TokenKind::RightParen, "Expected ')' after expression");

        let line = self.previous_line();
        if is_list {
            self.emit_const_int(num_items);
            self.emit_op(Op::CreateListFromCast, line);
        } else if is_set {
            self.emit_const_int(num_items);
            self.emit_op(Op::CreateSet, line);
        }

        self.pop_unused_expression_result();
    }

    fn list_literal(&mut self) {
        let mut single_item_parsed = false;
        let mut parsed_range_expression = false;
        let mut num_items = 0i64;

        loop {
            if self.match_kind(TokenKind::RightSquareParen) {
                break;
            }

            self.with_expression_used(|session| session.expression(false));

            if self.match_kind(TokenKind::DotDot) {
                if single_item_parsed {
                    self.error_at_previous(
                        "Cannot mix single items and range expressions in list declaration",
                    );
                    return;
                }

                // max
                self.with_expression_used(|session| session.expression(false));

                // optional `by <increment>`
                if self.match_kind(TokenKind::By) {
                    self.with_expression_used(|session| session.expression(false));
                } else {
                    let line = self.previous_line();
                    self.emit_const_int(1);
                    self.emit_op(Op::LoadConstant, line);
                }

                if !self.match_kind(TokenKind::RightSquareParen) {
                    self.error_at_current("Expected `]` after range expression");
                    return;
                }

                parsed_range_expression = true;
                break;
            }
            single_item_parsed = true;
            num_items += 1;

            if self.match_kind(TokenKind::RightSquareParen) {
                break;
            }
            self.consume(TokenKind::Comma, "Expected `,` between list items");
            if self.ctx_ref().panic_mode {
                return;
            }
        }

        let line = self.previous_line();
        if parsed_range_expression {
            self.emit_op(Op::CreateRange, line);
        } else {
            self.emit_const_int(num_items);
            self.emit_op(Op::CreateList, line);
        }
    }

    fn dictionary_literal(&mut self) {
        let mut num_items = 0i64;

        let prev = self.ctx_ref().using_expression_result;
        self.ctx().using_expression_result = true;
        loop {
            if self.match_kind(TokenKind::RightCurlyParen) {
                break;
            }

            self.expression(false);

            if !self.match_kind(TokenKind::Colon) {
                self.error_at_current("Expected ':' after key expression");
                return;
            }

            self.expression(false);
            num_items += 1;

            if self.match_kind(TokenKind::RightCurlyParen) {
                break;
            }
            self.consume(TokenKind::Comma, "Expected `,` between dictionary pairs");
            if self.ctx_ref().panic_mode {
                return;
            }
        }
        self.ctx().using_expression_result = prev;

        let line = self.previous_line();
        self.emit_const_int(num_items);
        self.emit_op(Op::CreateDictionary, line);
    }

    fn typename(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '('");
        self.with_expression_used(|session| session.expression(false));
        let line = self.previous_line();
        self.emit_op(Op::Typename, line);
        self.consume(TokenKind::RightParen, "Expected ')'");
    }
}
