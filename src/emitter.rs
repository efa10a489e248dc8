//! AST to bytecode lowering: symbol resolution, constant interning, control-flow emission, and
//! the two-pass handling of forward function references.

use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::token::Position;
use crate::value::Value;

/// A single bytecode instruction. Operands are inline fields rather than a raw byte stream:
/// jump targets are absolute indices into the same `Vec<Instr>`, not byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Const(u32),
    LoadGlobal(u32),
    StoreGlobal(u32),
    LoadLocal(u32),
    StoreLocal(u32),
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jmp(u32),
    JmpIfFalse(u32),
    CallName(u32, u32),
    Ret,
    Halt,
    ArrayNew(u32),
    ArrayGet,
    ArraySet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBc {
    pub code: Vec<Instr>,
    pub n_locals: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleBc {
    pub consts: Vec<Value>,
    /// Name -> global slot index. Kept only for debugging; the VM addresses globals by index.
    pub globals: HashMap<String, u32>,
    pub functions: HashMap<String, FunctionBc>,
    pub entry: Vec<Instr>,
}

#[derive(Debug, Clone)]
pub struct CgError {
    pub message: String,
    pub position: Option<Position>,
}

impl CgError {
    fn new(message: impl Into<String>, position: Position) -> Self {
        Self {
            message: message.into(),
            position: Some(position),
        }
    }

    fn undefined(name: &str, position: &Position) -> Self {
        Self::new(format!("undefined variable '{name}'"), position.clone())
    }

    fn assign_to_const(name: &str, position: &Position) -> Self {
        Self::new(format!("cannot assign to const '{name}'"), position.clone())
    }

    fn duplicate_global(name: &str, position: &Position) -> Self {
        Self::new(
            format!("'{name}' is declared as a global more than once"),
            position.clone(),
        )
    }
}

impl Display for CgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            Some(p) => write!(f, "{p}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CgError {}

type CgResult<T> = Result<T, CgError>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SymbolKind {
    Function,
    Variable,
}

#[derive(Debug, Clone, Copy)]
struct GlobalSymbol {
    index: u32,
    is_const: bool,
    kind: SymbolKind,
}

#[derive(Debug, Clone, Copy)]
struct LocalSymbol {
    index: u32,
    is_const: bool,
}

#[derive(Default)]
struct GlobalScope {
    entries: HashMap<String, GlobalSymbol>,
    next: u32,
}

impl GlobalScope {
    /// Reserves a slot for a hoisted function. Fails if the name was already claimed by another
    /// function found during pre-registration.
    fn declare_function(&mut self, name: &str) -> Result<u32, ()> {
        if self.entries.contains_key(name) {
            return Err(());
        }
        let index = self.next;
        self.next += 1;
        self.entries.insert(
            name.to_owned(),
            GlobalSymbol {
                index,
                is_const: true,
                kind: SymbolKind::Function,
            },
        );
        Ok(index)
    }

    /// Declares (or redeclares) a top-level `let`/`const` binding. Redeclaring an existing
    /// plain variable reuses its slot; colliding with a function name is an error.
    fn declare_variable(&mut self, name: &str, is_const: bool) -> Result<u32, ()> {
        if let Some(existing) = self.entries.get(name) {
            if existing.kind == SymbolKind::Function {
                return Err(());
            }
            let index = existing.index;
            self.entries.insert(
                name.to_owned(),
                GlobalSymbol {
                    index,
                    is_const,
                    kind: SymbolKind::Variable,
                },
            );
            return Ok(index);
        }
        let index = self.next;
        self.next += 1;
        self.entries.insert(
            name.to_owned(),
            GlobalSymbol {
                index,
                is_const,
                kind: SymbolKind::Variable,
            },
        );
        Ok(index)
    }

    fn get(&self, name: &str) -> Option<GlobalSymbol> {
        self.entries.get(name).copied()
    }
}

#[derive(Default)]
struct LocalScope {
    entries: HashMap<String, LocalSymbol>,
    next: u32,
}

impl LocalScope {
    fn declare_param(&mut self, name: &str) -> u32 {
        let index = self.next;
        self.next += 1;
        self.entries.insert(name.to_owned(), LocalSymbol { index, is_const: false });
        index
    }

    /// Declares (or redeclares) a `let`/`const` binding local to the enclosing function. There
    /// is a single flat local scope per function, so a nested block's `let` shares the table of
    /// the function it lives in rather than opening a new one.
    fn declare(&mut self, name: &str, is_const: bool) -> u32 {
        if let Some(existing) = self.entries.get(name) {
            let index = existing.index;
            self.entries.insert(name.to_owned(), LocalSymbol { index, is_const });
            return index;
        }
        let index = self.next;
        self.next += 1;
        self.entries.insert(name.to_owned(), LocalSymbol { index, is_const });
        index
    }

    fn get(&self, name: &str) -> Option<LocalSymbol> {
        self.entries.get(name).copied()
    }
}

enum Target<'a> {
    Global,
    Local(&'a mut LocalScope),
}

#[derive(Clone, Copy, PartialEq)]
enum StoreKind {
    Local,
    Global,
}

/// Key used to deduplicate the constant pool. Scalars collapse on (type tag, lexical text);
/// `null`/`true`/`false` are singletons; arrays collapse on a hash of their rendered form. The
/// array arm is exercised only if a future constant-folding pass starts interning array
/// literals; today `ARRAY_NEW` always builds arrays at runtime.
#[derive(PartialEq, Eq, Hash)]
enum ConstKey {
    Null,
    True,
    False,
    Scalar(&'static str, String),
    Array(u64),
}

fn const_key(value: &Value) -> ConstKey {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    match value {
        Value::Null => ConstKey::Null,
        Value::Bool(true) => ConstKey::True,
        Value::Bool(false) => ConstKey::False,
        Value::Int(n) => ConstKey::Scalar("int", n.to_string()),
        Value::Float(f) => ConstKey::Scalar("float", f.to_string()),
        Value::Str(s) => ConstKey::Scalar("str", s.clone()),
        Value::Array(_) => {
            let mut hasher = DefaultHasher::new();
            value.render().hash(&mut hasher);
            ConstKey::Array(hasher.finish())
        }
    }
}

#[derive(Default)]
struct Emitter {
    consts: Vec<Value>,
    const_index: HashMap<ConstKey, u32>,
    globals: GlobalScope,
    functions: HashMap<String, FunctionBc>,
}

/// Lowers a parsed program into a bytecode module.
///
/// Three passes: (1) walk the tree, without descending into `fun` bodies, to hoist every
/// function declaration into the global scope so forward references resolve; (2) emit each
/// hoisted function's body in its own local scope; (3) emit the remaining top-level statements
/// as the entry chunk, in source order, skipping `fun` declarations (already compiled in pass 2).
pub fn emit(program: &Program) -> CgResult<ModuleBc> {
    let mut emitter = Emitter::default();

    let mut fun_decls = vec![];
    collect_fun_decls(program, &mut fun_decls);

    for decl in &fun_decls {
        let Stmt::FunDecl { name, position, .. } = decl else {
            unreachable!("collect_fun_decls only collects FunDecl")
        };
        emitter
            .globals
            .declare_function(name)
            .map_err(|_| CgError::duplicate_global(name, position))?;
    }

    for decl in &fun_decls {
        let Stmt::FunDecl { name, params, body, .. } = decl else {
            unreachable!("collect_fun_decls only collects FunDecl")
        };
        let mut locals = LocalScope::default();
        for param in params {
            locals.declare_param(param);
        }
        let mut code = vec![];
        {
            let mut scope = Target::Local(&mut locals);
            for stmt in body {
                emitter.emit_stmt(stmt, &mut code, &mut scope)?;
            }
        }
        emitter.push_const(Value::Null, &mut code);
        code.push(Instr::Ret);
        emitter.functions.insert(
            name.clone(),
            FunctionBc {
                code,
                n_locals: locals.next,
            },
        );
    }

    let mut entry = vec![];
    {
        let mut scope = Target::Global;
        for stmt in program {
            emitter.emit_stmt(stmt, &mut entry, &mut scope)?;
        }
    }
    entry.push(Instr::Halt);

    let globals = emitter
        .globals
        .entries
        .iter()
        .map(|(name, sym)| (name.clone(), sym.index))
        .collect();

    Ok(ModuleBc {
        consts: emitter.consts,
        globals,
        functions: emitter.functions,
        entry,
    })
}

fn collect_fun_decls<'p>(stmts: &'p [Stmt], out: &mut Vec<&'p Stmt>) {
    for stmt in stmts {
        match stmt {
            Stmt::FunDecl { .. } => out.push(stmt),
            Stmt::Block(inner) => collect_fun_decls(inner, out),
            Stmt::If { then_branch, else_branch, .. } => {
                collect_fun_decls(std::slice::from_ref(then_branch.as_ref()), out);
                if let Some(else_branch) = else_branch {
                    collect_fun_decls(std::slice::from_ref(else_branch.as_ref()), out);
                }
            }
            Stmt::While { body, .. } => collect_fun_decls(std::slice::from_ref(body.as_ref()), out),
            Stmt::For { body, .. } => collect_fun_decls(std::slice::from_ref(body.as_ref()), out),
            _ => {}
        }
    }
}

fn parse_number(text: &str, position: &Position) -> CgResult<Value> {
    if text.contains('.') {
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| CgError::new(format!("invalid float literal '{text}'"), position.clone()))
    } else {
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| CgError::new(format!("invalid integer literal '{text}'"), position.clone()))
    }
}

fn binop_instr(op: BinaryOp) -> Instr {
    match op {
        BinaryOp::Add => Instr::Add,
        BinaryOp::Sub => Instr::Sub,
        BinaryOp::Mul => Instr::Mul,
        BinaryOp::Div => Instr::Div,
        BinaryOp::Mod => Instr::Mod,
        BinaryOp::Eq => Instr::Eq,
        BinaryOp::Ne => Instr::Ne,
        BinaryOp::Lt => Instr::Lt,
        BinaryOp::Le => Instr::Le,
        BinaryOp::Gt => Instr::Gt,
        BinaryOp::Ge => Instr::Ge,
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit ops are lowered separately"),
    }
}

impl Emitter {
    fn intern_const(&mut self, value: Value) -> u32 {
        let key = const_key(&value);
        if let Some(&index) = self.const_index.get(&key) {
            return index;
        }
        let index = self.consts.len() as u32;
        self.consts.push(value);
        self.const_index.insert(key, index);
        index
    }

    fn push_const(&mut self, value: Value, code: &mut Vec<Instr>) {
        let index = self.intern_const(value);
        code.push(Instr::Const(index));
    }

    fn declare(
        &mut self,
        name: &str,
        is_const: bool,
        scope: &mut Target,
        position: &Position,
    ) -> CgResult<u32> {
        match scope {
            Target::Global => self
                .globals
                .declare_variable(name, is_const)
                .map_err(|_| CgError::duplicate_global(name, position)),
            Target::Local(locals) => Ok(locals.declare(name, is_const)),
        }
    }

    /// Resolves an identifier: locals (if inside a function) shadow globals.
    fn resolve(&self, name: &str, scope: &Target) -> Option<(StoreKind, u32, bool)> {
        if let Target::Local(locals) = scope {
            if let Some(sym) = locals.get(name) {
                return Some((StoreKind::Local, sym.index, sym.is_const));
            }
        }
        self.globals
            .get(name)
            .map(|sym| (StoreKind::Global, sym.index, sym.is_const))
    }

    fn emit_stmt(&mut self, stmt: &Stmt, code: &mut Vec<Instr>, scope: &mut Target) -> CgResult<()> {
        match stmt {
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.emit_stmt(s, code, scope)?;
                }
                Ok(())
            }
            // Declaration only; the body was already compiled as a separate function chunk.
            Stmt::FunDecl { .. } => Ok(()),
            Stmt::Let { name, init, position } => {
                match init {
                    Some(expr) => self.emit_expr(expr, code, scope)?,
                    None => self.push_const(Value::Null, code),
                }
                let index = self.declare(name, false, scope, position)?;
                push_store(code, scope, index);
                code.push(Instr::Pop);
                Ok(())
            }
            Stmt::Const { name, init, position } => {
                self.emit_expr(init, code, scope)?;
                let index = self.declare(name, true, scope, position)?;
                push_store(code, scope, index);
                code.push(Instr::Pop);
                Ok(())
            }
            Stmt::ExprStmt(expr) => {
                self.emit_expr(expr, code, scope)?;
                code.push(Instr::Pop);
                Ok(())
            }
            Stmt::If { cond, then_branch, else_branch } => {
                self.emit_expr(cond, code, scope)?;
                let jump_to_else = emit_placeholder_jmp_if_false(code);
                code.push(Instr::Pop);
                self.emit_stmt(then_branch, code, scope)?;
                let jump_to_end = emit_placeholder_jmp(code);
                patch_jump_to_here(code, jump_to_else);
                code.push(Instr::Pop);
                if let Some(else_branch) = else_branch {
                    self.emit_stmt(else_branch, code, scope)?;
                }
                patch_jump_to_here(code, jump_to_end);
                Ok(())
            }
            Stmt::While { cond, body } => {
                let loop_start = code.len() as u32;
                self.emit_expr(cond, code, scope)?;
                let jump_to_end = emit_placeholder_jmp_if_false(code);
                code.push(Instr::Pop);
                self.emit_stmt(body, code, scope)?;
                code.push(Instr::Jmp(loop_start));
                patch_jump_to_here(code, jump_to_end);
                code.push(Instr::Pop);
                Ok(())
            }
            Stmt::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.emit_stmt(init, code, scope)?;
                }
                let loop_start = code.len() as u32;
                match cond {
                    Some(cond) => self.emit_expr(cond, code, scope)?,
                    None => self.push_const(Value::Bool(true), code),
                }
                let jump_to_end = emit_placeholder_jmp_if_false(code);
                code.push(Instr::Pop);
                self.emit_stmt(body, code, scope)?;
                if let Some(step) = step {
                    self.emit_stmt(step, code, scope)?;
                }
                code.push(Instr::Jmp(loop_start));
                patch_jump_to_here(code, jump_to_end);
                code.push(Instr::Pop);
                Ok(())
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.emit_expr(expr, code, scope)?,
                    None => self.push_const(Value::Null, code),
                }
                code.push(Instr::Ret);
                Ok(())
            }
        }
    }

    fn emit_expr(&mut self, expr: &Expr, code: &mut Vec<Instr>, scope: &mut Target) -> CgResult<()> {
        match expr {
            Expr::Ident(name, position) => {
                let (kind, index, _) = self
                    .resolve(name, scope)
                    .ok_or_else(|| CgError::undefined(name, position))?;
                code.push(match kind {
                    StoreKind::Local => Instr::LoadLocal(index),
                    StoreKind::Global => Instr::LoadGlobal(index),
                });
                Ok(())
            }
            Expr::Number(text, position) => {
                let value = parse_number(text, position)?;
                self.push_const(value, code);
                Ok(())
            }
            Expr::String(text, _) => {
                self.push_const(Value::Str(text.clone()), code);
                Ok(())
            }
            Expr::Bool(b, _) => {
                self.push_const(Value::Bool(*b), code);
                Ok(())
            }
            Expr::Null(_) => {
                self.push_const(Value::Null, code);
                Ok(())
            }
            Expr::Array(elements, _) => {
                for element in elements {
                    self.emit_expr(element, code, scope)?;
                }
                code.push(Instr::ArrayNew(elements.len() as u32));
                Ok(())
            }
            Expr::Index { array, index, .. } => {
                self.emit_expr(array, code, scope)?;
                self.emit_expr(index, code, scope)?;
                code.push(Instr::ArrayGet);
                Ok(())
            }
            Expr::Unary { op, operand, .. } => {
                self.emit_expr(operand, code, scope)?;
                code.push(match op {
                    UnaryOp::Neg => Instr::Neg,
                    UnaryOp::Not => Instr::Not,
                });
                Ok(())
            }
            Expr::Binary { op: BinaryOp::And, left, right, .. } => {
                self.emit_expr(left, code, scope)?;
                let jump_to_end = emit_placeholder_jmp_if_false(code);
                code.push(Instr::Pop);
                self.emit_expr(right, code, scope)?;
                patch_jump_to_here(code, jump_to_end);
                Ok(())
            }
            Expr::Binary { op: BinaryOp::Or, left, right, .. } => {
                self.emit_expr(left, code, scope)?;
                let jump_to_rhs = emit_placeholder_jmp_if_false(code);
                let jump_to_end = emit_placeholder_jmp(code);
                patch_jump_to_here(code, jump_to_rhs);
                code.push(Instr::Pop);
                self.emit_expr(right, code, scope)?;
                patch_jump_to_here(code, jump_to_end);
                Ok(())
            }
            Expr::Binary { op, left, right, .. } => {
                self.emit_expr(left, code, scope)?;
                self.emit_expr(right, code, scope)?;
                code.push(binop_instr(*op));
                Ok(())
            }
            Expr::Assign { lhs, rhs, position } => self.emit_assign(lhs, rhs, position, code, scope),
            Expr::Call { callee, args, .. } => self.emit_call(callee, args, code, scope),
        }
    }

    fn emit_assign(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        position: &Position,
        code: &mut Vec<Instr>,
        scope: &mut Target,
    ) -> CgResult<()> {
        match lhs {
            Expr::Ident(name, ident_pos) => {
                let (kind, index, is_const) = self
                    .resolve(name, scope)
                    .ok_or_else(|| CgError::undefined(name, ident_pos))?;
                if is_const {
                    return Err(CgError::assign_to_const(name, ident_pos));
                }
                self.emit_expr(rhs, code, scope)?;
                code.push(match kind {
                    StoreKind::Local => Instr::StoreLocal(index),
                    StoreKind::Global => Instr::StoreGlobal(index),
                });
                Ok(())
            }
            Expr::Index { array, index, .. } => {
                let Expr::Ident(name, ident_pos) = array.as_ref() else {
                    return Err(CgError::new(
                        "assignment to an index expression whose base is not a plain variable",
                        position.clone(),
                    ));
                };
                let (kind, slot, is_const) = self
                    .resolve(name, scope)
                    .ok_or_else(|| CgError::undefined(name, ident_pos))?;
                if is_const {
                    return Err(CgError::assign_to_const(name, ident_pos));
                }
                code.push(match kind {
                    StoreKind::Local => Instr::LoadLocal(slot),
                    StoreKind::Global => Instr::LoadGlobal(slot),
                });
                self.emit_expr(index, code, scope)?;
                self.emit_expr(rhs, code, scope)?;
                code.push(Instr::ArraySet);
                code.push(match kind {
                    StoreKind::Local => Instr::StoreLocal(slot),
                    StoreKind::Global => Instr::StoreGlobal(slot),
                });
                code.push(Instr::Pop);
                Ok(())
            }
            _ => Err(CgError::new("invalid assignment target", position.clone())),
        }
    }

    fn emit_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        code: &mut Vec<Instr>,
        scope: &mut Target,
    ) -> CgResult<()> {
        match callee {
            Expr::Ident(name, _) => {
                for arg in args {
                    self.emit_expr(arg, code, scope)?;
                }
                let name_const = self.intern_const(Value::Str(name.clone()));
                code.push(Instr::CallName(name_const, args.len() as u32));
                Ok(())
            }
            other => {
                self.emit_expr(other, code, scope)?;
                for arg in args {
                    self.emit_expr(arg, code, scope)?;
                }
                let sentinel = self.intern_const(Value::Str("__call_dynamic".to_owned()));
                code.push(Instr::CallName(sentinel, args.len() as u32));
                Ok(())
            }
        }
    }
}

fn push_store(code: &mut Vec<Instr>, scope: &Target, index: u32) {
    match scope {
        Target::Local(_) => code.push(Instr::StoreLocal(index)),
        Target::Global => code.push(Instr::StoreGlobal(index)),
    }
}

fn emit_placeholder_jmp(code: &mut Vec<Instr>) -> usize {
    code.push(Instr::Jmp(u32::MAX));
    code.len() - 1
}

fn emit_placeholder_jmp_if_false(code: &mut Vec<Instr>) -> usize {
    code.push(Instr::JmpIfFalse(u32::MAX));
    code.len() - 1
}

fn patch_jump_to_here(code: &mut Vec<Instr>, at: usize) {
    let target = code.len() as u32;
    match &mut code[at] {
        Instr::Jmp(t) | Instr::JmpIfFalse(t) => *t = target,
        other => unreachable!("patch site was not a jump: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{IncludeSet, Parser};
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    fn emit_source(src: &str) -> CgResult<ModuleBc> {
        let includes: IncludeSet = Rc::new(RefCell::new(HashSet::new()));
        let mut parser = Parser::new("test.wisp".into(), src, includes);
        let program = parser.parse_program().expect("parses");
        emit(&program)
    }

    #[test]
    fn interns_duplicate_constants() {
        let module = emit_source("print(1); print(1); print(\"x\"); print(\"x\");").unwrap();
        let ints = module.consts.iter().filter(|v| matches!(v, Value::Int(1))).count();
        let strs = module
            .consts
            .iter()
            .filter(|v| matches!(v, Value::Str(s) if s == "x"))
            .count();
        assert_eq!(ints, 1);
        assert_eq!(strs, 1);
    }

    #[test]
    fn forward_reference_to_function_compiles() {
        let module = emit_source("print(later()); fun later() { return 1; }").unwrap();
        assert!(module.functions.contains_key("later"));
    }

    #[test]
    fn duplicate_function_names_is_an_error() {
        let err = emit_source("fun f() {} fun f() {}").unwrap_err();
        assert!(err.message.contains("more than once"));
    }

    #[test]
    fn assigning_to_const_is_an_error() {
        let err = emit_source("const x = 1; x = 2;").unwrap_err();
        assert!(err.message.contains("cannot assign to const"));
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = emit_source("print(nope);").unwrap_err();
        assert!(err.message.contains("undefined variable"));
    }

    #[test]
    fn index_assignment_to_non_ident_base_is_an_error() {
        let err = emit_source("[1, 2][0] = 1;").unwrap_err();
        assert!(err.message.contains("not a plain variable"));
    }

    #[test]
    fn while_loop_lowers_to_balanced_jumps() {
        let module = emit_source("while (true) { print(1); }").unwrap();
        assert!(module.entry.iter().any(|i| matches!(i, Instr::Jmp(_))));
        assert!(module.entry.iter().any(|i| matches!(i, Instr::JmpIfFalse(_))));
    }
}
