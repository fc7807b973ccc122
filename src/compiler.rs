//! # Compiler Module
//!
//! Lowers the AST into register bytecode.
//!
//! One program compiles into one [`BuildPrototype`]: function 0 is the
//! synthetic `__initGlobals` holding every top-level statement, followed by
//! one function per declaration in source order. Operations are kept in their
//! tagged [`Operation`] form until [`Compiler::compile`] finalizes them, so
//! jump offsets can be backpatched and re-validated.
//!
//! ## Register resolution
//! Globals are consulted before the current function's locals. A name first
//! seen inside a function without a declaration becomes a local of that
//! function; at the top level it becomes a global.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::*;
use crate::error::{CompileError, EvalError, EvalResult, Span};
use crate::instruction::{
    Immediate, Instruction, Opcode, Operand, Operation, Scope, RETURN_LAST, RETURN_REGISTER,
};
use crate::register::{FunctionRef, RegisterList, RegisterPrototype};
use crate::runtime::Runtime;

/// Name of the function holding top-level statements, always at address 0.
pub const INIT_GLOBALS: &str = "__initGlobals";

/// A compiled function's entry in the function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionPrototype {
    pub name: String,
    /// Index of the function's first instruction.
    pub start: usize,
    /// Local registers a call frame needs.
    pub registers_needed: usize,
}

/// Everything the linker needs to produce a script.
#[derive(Debug, Clone)]
pub struct BuildPrototype {
    pub instructions: Vec<Instruction>,
    pub functions: Vec<FunctionPrototype>,
    pub function_lookup: FxHashMap<String, u32>,
    pub globals: Vec<RegisterPrototype>,
    pub global_names: FxHashMap<String, u32>,
    /// Backing text for every string constant.
    pub string_data: String,
}

impl BuildPrototype {
    /// One instruction per line, with function headers.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, ins) in self.instructions.iter().enumerate() {
            if let Some(f) = self.functions.iter().find(|f| f.start == i) {
                out.push_str(&format!("{}:\n", f.name));
            }
            out.push_str(&format!("  {:04} {:?}\n", i, ins));
        }
        out
    }
}

/// How an identifier should be resolved to a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// `var` and parameters: must not shadow a global inside a function.
    Declare,
    /// Assignment target: bind a new variable if unknown.
    Assign,
    /// Plain read: falls back to a function pointer, then an implicit variable.
    Read,
    /// Call argument: must name a variable or function.
    Defined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Loop,
    Switch,
}

/// An open loop or switch and its unresolved jumps.
#[derive(Debug)]
struct BlockScope {
    kind: BlockKind,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

pub struct Compiler<'rt> {
    runtime: &'rt Runtime,
    ops: Vec<Operation>,
    globals: RegisterList,
    /// Locals of the function being compiled; `None` at the top level.
    locals: Option<RegisterList>,
    functions: Vec<FunctionPrototype>,
    function_lookup: FxHashMap<String, u32>,
    blocks: Vec<BlockScope>,
    current_span: Span,
    /// Set while compiling call arguments: every name they mention must
    /// already be defined.
    in_arguments: bool,
}

impl<'rt> Compiler<'rt> {
    fn new(runtime: &'rt Runtime) -> Self {
        Self {
            runtime,
            ops: Vec::new(),
            globals: RegisterList::new(Scope::Global),
            locals: None,
            functions: Vec::new(),
            function_lookup: FxHashMap::default(),
            blocks: Vec::new(),
            current_span: Span::default(),
            in_arguments: false,
        }
    }

    /// Compiles a whole program. Native function names are resolved against
    /// `runtime`, so natives must be registered before compiling.
    pub fn compile(stmts: &[Stmt], runtime: &'rt Runtime) -> Result<BuildPrototype, CompileError> {
        let mut compiler = Compiler::new(runtime);
        match compiler.compile_program(stmts) {
            Ok(()) => compiler
                .finalize()
                .map_err(|error| CompileError::new(error, Span::default())),
            Err(error) => Err(CompileError::new(error, compiler.current_span)),
        }
    }

    fn compile_program(&mut self, stmts: &[Stmt]) -> EvalResult<()> {
        self.declare_function(INIT_GLOBALS)?;

        for stmt in stmts {
            if let Stmt::FunDecl { name, span, .. } = stmt {
                self.current_span = *span;
                self.declare_function(name)?;
            }
        }

        for stmt in stmts {
            if !matches!(stmt, Stmt::FunDecl { .. }) {
                self.compile_stmt(stmt)?;
            }
        }
        self.emit_epilogue()?;

        let mut address = 1usize;
        for stmt in stmts {
            if let Stmt::FunDecl {
                params, body, span, ..
            } = stmt
            {
                self.current_span = *span;
                self.compile_function(address, params, body)?;
                address += 1;
            }
        }

        Ok(())
    }

    fn declare_function(&mut self, name: &str) -> EvalResult<()> {
        if self.runtime.native_function_address(name).is_some() {
            return Err(EvalError::NativeFunctionAlreadyDefined);
        }
        if self.function_lookup.contains_key(name) {
            return Err(EvalError::ScriptFunctionAlreadyDefined);
        }
        self.functions
            .try_reserve(1)
            .map_err(|_| EvalError::OutOfMemory)?;
        let address = self.functions.len() as u32;
        self.functions.push(FunctionPrototype {
            name: name.to_string(),
            start: 0,
            registers_needed: 0,
        });
        self.function_lookup.insert(name.to_string(), address);
        Ok(())
    }

    fn compile_function(&mut self, address: usize, params: &[String], body: &[Stmt]) -> EvalResult<()> {
        let start = self.ops.len();
        self.locals = Some(RegisterList::new(Scope::Local));

        for param in params {
            if self.locals.as_ref().and_then(|l| l.get_variable(param)).is_some() {
                return Err(EvalError::VariableAlreadyDefined);
            }
            self.resolve(param, Lookup::Declare)?;
        }

        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.emit_epilogue()?;

        let registers_needed = self.locals.take().map_or(0, |l| l.len());
        let function = self
            .functions
            .get_mut(address)
            .ok_or(EvalError::InvalidArgument)?;
        function.start = start;
        function.registers_needed = registers_needed;
        Ok(())
    }

    fn finalize(self) -> EvalResult<BuildPrototype> {
        let mut instructions = Vec::new();
        instructions
            .try_reserve_exact(self.ops.len())
            .map_err(|_| EvalError::OutOfMemory)?;
        for op in &self.ops {
            instructions.push(op.encode()?);
        }

        let (globals, global_names, string_data) = self.globals.into_parts();
        debug!(
            instructions = instructions.len(),
            functions = self.functions.len(),
            globals = globals.len(),
            "compiled build"
        );

        Ok(BuildPrototype {
            instructions,
            functions: self.functions,
            function_lookup: self.function_lookup,
            globals,
            global_names,
            string_data,
        })
    }

    // -------------------------------------------------------------------------
    // EMISSION
    // -------------------------------------------------------------------------

    fn push_op(&mut self, op: Operation) -> EvalResult<usize> {
        op.encode()?;
        self.ops.try_reserve(1).map_err(|_| EvalError::OutOfMemory)?;
        self.ops.push(op);
        Ok(self.ops.len() - 1)
    }

    fn emit_abc(&mut self, op: Opcode, a: Operand, b: Operand, c: Operand) -> EvalResult<usize> {
        self.push_op(Operation::Abc { op, a, b, c })
    }

    fn emit_abx(&mut self, op: Opcode, a: Operand, bx: Immediate) -> EvalResult<usize> {
        self.push_op(Operation::Abx { op, a, bx })
    }

    /// Emits an unpatched `ConditionalGoto` on `cond`.
    fn emit_conditional_jump(&mut self, cond: Operand) -> EvalResult<usize> {
        self.emit_abx(Opcode::ConditionalGoto, cond, Immediate::Signed(0))
    }

    /// Emits an unpatched `Goto`.
    fn emit_jump(&mut self) -> EvalResult<usize> {
        self.push_op(Operation::Ax {
            op: Opcode::Goto,
            ax: Immediate::Signed(0),
        })
    }

    fn emit_jump_to(&mut self, target: usize) -> EvalResult<()> {
        let at = self.emit_jump()?;
        self.patch_jump(at, target)
    }

    /// Points the jump at `at` to `target`.
    fn patch_jump(&mut self, at: usize, target: usize) -> EvalResult<()> {
        let offset = i32::try_from(target as i64 - at as i64)
            .map_err(|_| EvalError::InstructionOverflow)?;
        let patched = match self.ops.get(at) {
            Some(&Operation::Abx {
                op: Opcode::ConditionalGoto,
                a,
                ..
            }) => Operation::Abx {
                op: Opcode::ConditionalGoto,
                a,
                bx: Immediate::Signed(offset),
            },
            Some(&Operation::Ax { op: Opcode::Goto, .. }) => Operation::Ax {
                op: Opcode::Goto,
                ax: Immediate::Signed(offset),
            },
            _ => return Err(EvalError::InvalidArgument),
        };
        patched.encode()?;
        self.ops[at] = patched;
        Ok(())
    }

    fn patch_all(&mut self, sites: &[usize], target: usize) -> EvalResult<()> {
        for &site in sites {
            self.patch_jump(site, target)?;
        }
        Ok(())
    }

    /// Closes a function body with a final `Return` so control never runs
    /// into the next function, whatever jumps target the end.
    fn emit_epilogue(&mut self) -> EvalResult<()> {
        self.emit_abx(
            Opcode::Return,
            Operand::local(0),
            Immediate::Unsigned(RETURN_LAST),
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // REGISTERS
    // -------------------------------------------------------------------------

    fn scope_mut(&mut self) -> &mut RegisterList {
        match self.locals.as_mut() {
            Some(locals) => locals,
            None => &mut self.globals,
        }
    }

    fn temp(&mut self) -> EvalResult<Operand> {
        let list = self.scope_mut();
        let index = list.add_temporary()?;
        Ok(list.operand(index))
    }

    fn number(&mut self, text: &str) -> EvalResult<Operand> {
        let index = self.globals.add_number_constant(text)?;
        Ok(Operand::global(index))
    }

    fn string(&mut self, text: &str) -> EvalResult<Operand> {
        let index = self.globals.add_string_constant(text)?;
        Ok(Operand::global(index))
    }

    fn register_mut(&mut self, operand: Operand) -> Option<&mut RegisterPrototype> {
        match operand.scope {
            Scope::Global => self.globals.get_mut(operand.index),
            Scope::Local => self.locals.as_mut()?.get_mut(operand.index),
        }
    }

    /// Fails if `operand` is a `const` that already holds its value.
    fn check_assignable(&mut self, operand: Operand) -> EvalResult<()> {
        match self.register_mut(operand) {
            Some(reg) if reg.is_const && reg.assigned => Err(EvalError::VariableAlreadyDefined),
            _ => Ok(()),
        }
    }

    /// A bound variable named `name`, globals first.
    fn lookup_variable(&self, name: &str) -> Option<Operand> {
        if let Some(index) = self.globals.get_variable(name) {
            return Some(Operand::global(index));
        }
        let locals = self.locals.as_ref()?;
        locals.get_variable(name).map(Operand::local)
    }

    /// A constant register pointing at the function called `name`.
    fn function_pointer(&mut self, name: &str) -> EvalResult<Option<Operand>> {
        let function = if self.runtime.native_function_address(name).is_some() {
            FunctionRef::Native(name.to_string())
        } else if let Some(&address) = self.function_lookup.get(name) {
            FunctionRef::Script(address)
        } else {
            return Ok(None);
        };
        let index = self.globals.add_function_pointer(function)?;
        Ok(Some(Operand::global(index)))
    }

    fn resolve(&mut self, name: &str, lookup: Lookup) -> EvalResult<Operand> {
        if let Some(index) = self.globals.get_variable(name) {
            if lookup == Lookup::Declare && self.locals.is_some() {
                return Err(EvalError::VariableAlreadyDefined);
            }
            return Ok(Operand::global(index));
        }
        if let Some(index) = self.locals.as_ref().and_then(|l| l.get_variable(name)) {
            return Ok(Operand::local(index));
        }

        let lookup = match lookup {
            Lookup::Read | Lookup::Assign if self.in_arguments => Lookup::Defined,
            other => other,
        };
        match lookup {
            Lookup::Declare | Lookup::Assign => {}
            Lookup::Read => {
                if let Some(pointer) = self.function_pointer(name)? {
                    return Ok(pointer);
                }
            }
            Lookup::Defined => {
                return self
                    .function_pointer(name)?
                    .ok_or(EvalError::VariableNotDefined);
            }
        }

        let list = self.scope_mut();
        let index = list.add_variable(name)?;
        Ok(list.operand(index))
    }

    // -------------------------------------------------------------------------
    // STATEMENTS
    // -------------------------------------------------------------------------

    fn compile_stmt(&mut self, stmt: &Stmt) -> EvalResult<()> {
        self.current_span = stmt.span();
        match stmt {
            Stmt::VarDecl {
                name,
                initializer,
                is_const,
                ..
            } => self.compile_var_decl(name, initializer.as_ref(), *is_const),
            Stmt::FunDecl { .. } => Err(EvalError::InvalidArgument),
            Stmt::ExprStmt { expr, .. } => self.compile_expr(expr).map(|_| ()),
            Stmt::Block { stmts, .. } => {
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                Ok(())
            }
            Stmt::Return { value, .. } => self.compile_return(value.as_ref()),
            Stmt::If { .. } => self.compile_if(stmt),
            Stmt::While {
                condition, body, ..
            } => self.compile_while(condition, body),
            Stmt::DoWhile {
                body, condition, ..
            } => self.compile_do_while(body, condition),
            Stmt::For {
                init,
                condition,
                update,
                body,
                ..
            } => self.compile_for(init.as_deref(), condition.as_ref(), update.as_ref(), body),
            Stmt::Switch { value, cases, .. } => self.compile_switch(value, cases),
            Stmt::Break { .. } => {
                let at = self.emit_jump()?;
                let block = self.blocks.last_mut().ok_or(EvalError::UnexpectedBreak)?;
                block.breaks.push(at);
                Ok(())
            }
            Stmt::Continue { .. } => {
                let at = self.emit_jump()?;
                let block = self
                    .blocks
                    .iter_mut()
                    .rev()
                    .find(|b| b.kind == BlockKind::Loop)
                    .ok_or(EvalError::UnexpectedContinue)?;
                block.continues.push(at);
                Ok(())
            }
        }
    }

    fn compile_var_decl(&mut self, name: &str, initializer: Option<&Expr>, is_const: bool) -> EvalResult<()> {
        if is_const && self.lookup_variable(name).is_some() {
            return Err(EvalError::VariableAlreadyDefined);
        }
        let dst = self.resolve(name, Lookup::Declare)?;

        if let Some(init) = initializer {
            self.check_assignable(dst)?;
            let src = self.compile_expr(init)?;
            self.emit_abc(Opcode::Move, dst, src, Operand::local(0))?;
        }

        if is_const {
            if let Some(reg) = self.register_mut(dst) {
                reg.is_const = true;
                reg.assigned = true;
            }
        }
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> EvalResult<()> {
        match value {
            Some(expr) => {
                let src = self.compile_expr(expr)?;
                self.emit_abx(Opcode::Return, src, Immediate::Unsigned(RETURN_REGISTER))?;
            }
            None => {
                self.emit_abx(Opcode::Return, Operand::local(0), Immediate::Unsigned(0))?;
            }
        }
        Ok(())
    }

    /// Lowers an `if` / `else if` / `else` chain without recursing into the
    /// `else if` links. Each taken branch jumps past the whole chain.
    fn compile_if(&mut self, stmt: &Stmt) -> EvalResult<()> {
        let mut exits = Vec::new();
        let mut current = stmt;

        loop {
            self.current_span = current.span();
            let Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } = current
            else {
                self.compile_stmt(current)?;
                break;
            };

            let cond = self.compile_expr(condition)?;
            let skip = self.emit_conditional_jump(cond)?;
            self.compile_stmt(then_branch)?;

            match else_branch {
                Some(next) => {
                    exits.push(self.emit_jump()?);
                    self.patch_jump(skip, self.ops.len())?;
                    current = next;
                }
                None => {
                    self.patch_jump(skip, self.ops.len())?;
                    break;
                }
            }
        }

        self.patch_all(&exits, self.ops.len())
    }

    fn open_block(&mut self, kind: BlockKind) {
        self.blocks.push(BlockScope {
            kind,
            breaks: Vec::new(),
            continues: Vec::new(),
        });
    }

    /// Resolves the innermost block's breaks to `end` and continues to
    /// `next_iteration`.
    fn close_block(&mut self, end: usize, next_iteration: usize) -> EvalResult<()> {
        let block = self.blocks.pop().ok_or(EvalError::InvalidArgument)?;
        self.patch_all(&block.breaks, end)?;
        self.patch_all(&block.continues, next_iteration)
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt) -> EvalResult<()> {
        let begin = self.ops.len();
        let cond = self.compile_expr(condition)?;
        let exit = self.emit_conditional_jump(cond)?;

        self.open_block(BlockKind::Loop);
        self.compile_stmt(body)?;
        self.emit_jump_to(begin)?;

        let end = self.ops.len();
        self.patch_jump(exit, end)?;
        self.close_block(end, begin)
    }

    fn compile_do_while(&mut self, body: &Stmt, condition: &Expr) -> EvalResult<()> {
        let begin = self.ops.len();
        self.open_block(BlockKind::Loop);
        self.compile_stmt(body)?;

        let test = self.ops.len();
        self.current_span = condition.span();
        let cond = self.compile_expr(condition)?;
        let exit = self.emit_conditional_jump(cond)?;
        self.emit_jump_to(begin)?;

        let end = self.ops.len();
        self.patch_jump(exit, end)?;
        self.close_block(end, test)
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
    ) -> EvalResult<()> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }

        let begin = self.ops.len();
        let exit = match condition {
            Some(cond) => {
                let reg = self.compile_expr(cond)?;
                Some(self.emit_conditional_jump(reg)?)
            }
            None => None,
        };

        self.open_block(BlockKind::Loop);
        self.compile_stmt(body)?;

        let next_iteration = self.ops.len();
        if let Some(update) = update {
            self.compile_expr(update)?;
        }
        self.emit_jump_to(begin)?;

        let end = self.ops.len();
        if let Some(exit) = exit {
            self.patch_jump(exit, end)?;
        }
        self.close_block(end, next_iteration)
    }

    /// Each case tests `value == test` and skips to the next case on failure.
    /// A body that does not end in `break` falls through into the next body.
    fn compile_switch(&mut self, value: &Expr, cases: &[SwitchCase]) -> EvalResult<()> {
        let value = self.compile_expr(value)?;
        self.open_block(BlockKind::Switch);

        let mut fallthrough: Option<usize> = None;
        for case in cases {
            self.current_span = case.span;
            let skip = match &case.test {
                Some(test) => {
                    let test = self.compile_expr(test)?;
                    let matched = self.temp()?;
                    self.emit_abc(Opcode::Equals, matched, value, test)?;
                    Some(self.emit_conditional_jump(matched)?)
                }
                None => None,
            };

            if let Some(site) = fallthrough.take() {
                self.patch_jump(site, self.ops.len())?;
            }

            for stmt in &case.body {
                self.compile_stmt(stmt)?;
            }
            if !matches!(case.body.last(), Some(Stmt::Break { .. })) {
                fallthrough = Some(self.emit_jump()?);
            }

            if let Some(skip) = skip {
                self.patch_jump(skip, self.ops.len())?;
            }
        }

        let end = self.ops.len();
        if let Some(site) = fallthrough {
            self.patch_jump(site, end)?;
        }
        self.close_block(end, end)
    }

    // -------------------------------------------------------------------------
    // EXPRESSIONS
    // -------------------------------------------------------------------------

    /// Compiles `expr`, returning the register holding its value.
    fn compile_expr(&mut self, expr: &Expr) -> EvalResult<Operand> {
        self.current_span = expr.span();
        match expr {
            Expr::Number { text, .. } => self.number(text),
            Expr::Str { value, .. } => self.string(value),
            Expr::Bool { value, .. } => self.number(if *value { "1" } else { "0" }),
            Expr::Null { .. } => Ok(Operand::global(self.globals.add_null()?)),
            Expr::Type { ty, .. } => Ok(Operand::global(self.globals.add_type(*ty)?)),
            Expr::Ident { name, .. } => self.resolve(name, Lookup::Read),

            Expr::Binary {
                left, op, right, ..
            } => {
                let l = self.compile_expr(left)?;
                let r = self.compile_expr(right)?;
                let dst = self.temp()?;
                self.emit_abc(opcode_for(*op), dst, l, r)?;
                Ok(dst)
            }

            Expr::Unary { op, operand, .. } => {
                let src = self.compile_expr(operand)?;
                let dst = self.temp()?;
                match op {
                    UnaryOp::Neg => {
                        let minus_one = self.number("-1")?;
                        self.emit_abc(Opcode::Multiply, dst, src, minus_one)?;
                    }
                    UnaryOp::Not => {
                        let zero = self.number("0")?;
                        self.emit_abc(Opcode::Equals, dst, src, zero)?;
                    }
                }
                Ok(dst)
            }

            Expr::Assign { target, value, .. } => self.compile_assign(target, value),
            Expr::CompoundAssign {
                target, op, value, ..
            } => {
                let rhs = self.compile_expr(value)?;
                self.compile_update(target, opcode_for(*op), rhs, false)
            }
            Expr::PreIncDec { op, operand, .. } => {
                let one = self.number("1")?;
                self.compile_update(operand, incdec_opcode(*op), one, false)
            }
            Expr::PostIncDec { op, operand, .. } => {
                let one = self.number("1")?;
                self.compile_update(operand, incdec_opcode(*op), one, true)
            }

            Expr::Call { callee, args, .. } => self.compile_call(callee, args),

            Expr::Index { object, index, .. } => {
                let container = self.compile_expr(object)?;
                let key = self.compile_expr(index)?;
                let dst = self.temp()?;
                self.emit_abc(Opcode::ComplexGet, dst, container, key)?;
                Ok(dst)
            }
            Expr::MemberAccess { object, member, .. } => {
                let container = self.compile_expr(object)?;
                let key = self.string(member)?;
                let dst = self.temp()?;
                self.emit_abc(Opcode::ComplexGet, dst, container, key)?;
                Ok(dst)
            }

            Expr::Array { elements, .. } => {
                let size = self.number(&elements.len().to_string())?;
                let dst = self.temp()?;
                self.emit_abc(Opcode::NewArray, dst, size, Operand::local(0))?;
                for (i, element) in elements.iter().enumerate() {
                    let value = self.compile_expr(element)?;
                    let index = self.number(&i.to_string())?;
                    self.emit_abc(Opcode::ComplexSet, dst, index, value)?;
                }
                Ok(dst)
            }
            Expr::Object { entries, .. } => {
                let dst = self.temp()?;
                self.emit_abc(Opcode::NewObject, dst, Operand::local(0), Operand::local(0))?;
                for (key, value) in entries {
                    let value = self.compile_expr(value)?;
                    let key = self.string(key)?;
                    self.emit_abc(Opcode::ComplexSet, dst, key, value)?;
                }
                Ok(dst)
            }
        }
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr) -> EvalResult<Operand> {
        match target {
            Expr::Ident { name, .. } => {
                let dst = self.resolve(name, Lookup::Assign)?;
                self.check_assignable(dst)?;
                let src = self.compile_expr(value)?;
                self.emit_abc(Opcode::Move, dst, src, Operand::local(0))?;
                Ok(dst)
            }
            Expr::Index { object, index, .. } => {
                let container = self.compile_expr(object)?;
                let key = self.compile_expr(index)?;
                let src = self.compile_expr(value)?;
                self.emit_abc(Opcode::ComplexSet, container, key, src)?;
                Ok(src)
            }
            Expr::MemberAccess { object, member, .. } => {
                let container = self.compile_expr(object)?;
                let key = self.string(member)?;
                let src = self.compile_expr(value)?;
                self.emit_abc(Opcode::ComplexSet, container, key, src)?;
                Ok(src)
            }
            _ => Err(EvalError::InvalidArgument),
        }
    }

    /// Applies `target = target <op> rhs` in place. With `keep_old`, the
    /// previous value is copied out first and becomes the result.
    fn compile_update(&mut self, target: &Expr, op: Opcode, rhs: Operand, keep_old: bool) -> EvalResult<Operand> {
        let (container, key) = match target {
            Expr::Ident { name, .. } => {
                let dst = self.resolve(name, Lookup::Assign)?;
                self.check_assignable(dst)?;
                let old = if keep_old {
                    let copy = self.temp()?;
                    self.emit_abc(Opcode::Move, copy, dst, Operand::local(0))?;
                    Some(copy)
                } else {
                    None
                };
                self.emit_abc(op, dst, dst, rhs)?;
                return Ok(old.unwrap_or(dst));
            }
            Expr::Index { object, index, .. } => {
                let container = self.compile_expr(object)?;
                let key = self.compile_expr(index)?;
                (container, key)
            }
            Expr::MemberAccess { object, member, .. } => {
                let container = self.compile_expr(object)?;
                let key = self.string(member)?;
                (container, key)
            }
            _ => return Err(EvalError::InvalidArgument),
        };

        let current = self.temp()?;
        self.emit_abc(Opcode::ComplexGet, current, container, key)?;
        let old = if keep_old {
            let copy = self.temp()?;
            self.emit_abc(Opcode::Move, copy, current, Operand::local(0))?;
            Some(copy)
        } else {
            None
        };
        self.emit_abc(op, current, current, rhs)?;
        self.emit_abc(Opcode::ComplexSet, container, key, current)?;
        Ok(old.unwrap_or(current))
    }

    /// Arguments are evaluated before the call instruction, which is followed
    /// by one `FunctionArg` per argument.
    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> EvalResult<Operand> {
        let outer = std::mem::replace(&mut self.in_arguments, true);
        let arg_regs = args
            .iter()
            .map(|arg| self.compile_expr(arg))
            .collect::<EvalResult<Vec<_>>>();
        self.in_arguments = outer;
        let arg_regs = arg_regs?;
        let count = u32::try_from(arg_regs.len()).map_err(|_| EvalError::InstructionOverflow)?;

        self.current_span = callee.span();
        let dst = self.temp()?;
        match callee {
            Expr::Ident { name, .. } => {
                if let Some(address) = self.runtime.native_function_address(name) {
                    self.emit_abx(Opcode::NativeFunction, dst, Immediate::Unsigned(address))?;
                } else if let Some(&address) = self.function_lookup.get(name.as_str()) {
                    self.emit_abx(Opcode::ScriptFunction, dst, Immediate::Unsigned(address))?;
                } else if let Some(reg) = self.lookup_variable(name) {
                    self.emit_abc(Opcode::Invoke, dst, reg, Operand::local(0))?;
                } else {
                    return Err(EvalError::FunctionNotDefined);
                }
            }
            other => {
                let reg = self.compile_expr(other)?;
                self.emit_abc(Opcode::Invoke, dst, reg, Operand::local(0))?;
            }
        }

        for (i, reg) in arg_regs.into_iter().enumerate() {
            let bx = if i == 0 { count } else { 0 };
            self.emit_abx(Opcode::FunctionArg, reg, Immediate::Unsigned(bx))?;
        }
        Ok(dst)
    }
}

fn opcode_for(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Subtract,
        BinOp::Mul => Opcode::Multiply,
        BinOp::Div => Opcode::Divide,
        BinOp::Pow => Opcode::Power,
        BinOp::Eq => Opcode::Equals,
        BinOp::Ne => Opcode::NotEquals,
        BinOp::Lt => Opcode::LessThan,
        BinOp::Le => Opcode::LessThanEquals,
        BinOp::Gt => Opcode::MoreThan,
        BinOp::Ge => Opcode::MoreThanEquals,
        BinOp::And => Opcode::LogicalAnd,
        BinOp::Or => Opcode::LogicalOr,
        BinOp::Is => Opcode::Is,
        BinOp::As => Opcode::As,
        BinOp::Shift => Opcode::ComplexShift,
    }
}

fn incdec_opcode(op: IncDecOp) -> Opcode {
    match op {
        IncDecOp::Inc => Opcode::Add,
        IncDecOp::Dec => Opcode::Subtract,
    }
}
