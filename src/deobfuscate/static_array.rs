use std::default::Default;
use swc_core::common::util::take::Take;
use swc_core::common::{EqIgnoreSpan, Span, Spanned};
use swc_core::ecma::ast::{
    ArrayLit, AssignExpr, CallExpr, Callee, Expr, Function, KeyValueProp, Lit, MemberProp,
    ModuleItem, Pat, PatOrExpr, Program, PropName, Stmt
};
use swc_core::ecma::visit::{Visit, VisitMut, VisitMutWith, VisitWith};

use super::eval;
use crate::trace::Trace;

/// Folds calls to a discovered literal-array accessor into the literal
/// values themselves.
///
/// The pattern is an assignment `Name = (function () { ... })()` whose
/// body builds an object with an accessor property returning
/// `[ ...literals ][index]`. Once found, every later call
/// `Name.accessor(indexExpr)` with a statically known, in-range index is
/// replaced by the element literal, and the defining assignment is
/// removed after the traversal. Absence of the pattern is a no-op.
pub struct Visitor {
    trace: Trace,

    /// The discovered accessor, if any. First candidate wins.
    info: Option<ArrayInfo>,

    /// Spans of discovered defining assignments. The enclosing statements
    /// are removed after the traversal completes, never mid-walk.
    remove_spans: Vec<Span>
}

struct ArrayInfo {
    /// The assignment target, kept as an expression so member-path
    /// targets compare structurally, not just bare identifiers.
    object: Expr,

    /// The accessor property name.
    accessor: String,

    /// The array elements, folded to literals.
    values: Vec<Lit>
}

impl Visitor {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            info: None,
            remove_spans: Vec::new()
        }
    }
}

impl VisitMut for Visitor {
    fn visit_mut_program(&mut self, program: &mut Program) {
        program.visit_mut_children_with(self);

        if self.info.is_none() {
            self.trace.log("[inline-array] no literal-array accessor found");
            return;
        }

        // Deferred removal: apply the collected targets now that the
        // traversal is done, in reverse discovery order.
        if !self.remove_spans.is_empty() {
            self.trace.log(format!(
                "[inline-array] removing {} array definition(s)",
                self.remove_spans.len()
            ));
            let mut cleanup = RemoveStmtsVisitor {
                spans: self.remove_spans.iter().rev().copied().collect()
            };
            program.visit_mut_children_with(&mut cleanup);
        }
    }

    fn visit_mut_expr(&mut self, expr: &mut Expr) {
        // Discovery and rewriting happen in one walk, so only calls that
        // appear after the defining assignment are folded.
        if let Expr::Assign(assign) = expr {
            self.try_discover(assign);
        }
        if let Expr::Call(call) = expr {
            if let Some(lit) = self.try_fold_call(call) {
                *expr = Expr::Lit(lit);
                return;
            }
        }

        expr.visit_mut_children_with(self);
    }
}

impl Visitor {
    fn try_discover(&mut self, assign: &AssignExpr) {
        if self.info.is_some() {
            return;
        }

        // Right side must be a self-invoking function expression
        let call = match unparen(&assign.right) {
            Expr::Call(call) => call,
            _ => return
        };
        let fn_expr = match &call.callee {
            Callee::Expr(callee) => match unparen(callee) {
                Expr::Fn(f) => f,
                _ => return
            },
            _ => return
        };

        let mut find = FindTableVisitor::default();
        fn_expr.function.visit_with(&mut find);
        let (accessor, values) = match find.found {
            Some(v) => v,
            None => return
        };

        let object = match left_as_expr(&assign.left) {
            Some(v) => v,
            None => return
        };

        self.trace.log(format!(
            "[inline-array] discovered accessor {}.{} over {} literal(s)",
            expr_desc(&object),
            accessor,
            values.len()
        ));

        self.remove_spans.push(assign.span);
        self.info = Some(ArrayInfo {
            object,
            accessor,
            values
        });
    }

    fn try_fold_call(&self, call: &CallExpr) -> Option<Lit> {
        let info = self.info.as_ref()?;

        let member = match &call.callee {
            Callee::Expr(callee) => match unparen(callee) {
                Expr::Member(m) => m,
                _ => return None
            },
            _ => return None
        };
        match &member.prop {
            MemberProp::Ident(id) if id.sym.as_ref() == info.accessor => {}
            _ => return None
        }
        if !info.object.eq_ignore_span(unparen(&member.obj)) {
            return None;
        }

        let arg = match call.args.get(0) {
            Some(arg) if arg.spread.is_none() => arg,
            _ => {
                self.trace.log(format!(
                    "[inline-array] call to {}.{} has no usable index, leaving it",
                    expr_desc(&info.object),
                    info.accessor
                ));
                return None;
            }
        };
        let index = match eval::fold_to_number(&arg.expr) {
            Some(v) => v,
            None => {
                self.trace.log(format!(
                    "[inline-array] index of {}.{} call is not statically known, leaving it",
                    expr_desc(&info.object),
                    info.accessor
                ));
                return None;
            }
        };
        if index < 0.0 || index.fract() != 0.0 || index >= info.values.len() as f64 {
            self.trace.log(format!(
                "[inline-array] index {} is out of bounds for {}.{}, leaving it",
                index,
                expr_desc(&info.object),
                info.accessor
            ));
            return None;
        }

        let lit = info.values[index as usize].clone();
        self.trace.log(format!(
            "[inline-array] folded {}.{}({}) to a literal",
            expr_desc(&info.object),
            info.accessor,
            index
        ));
        Some(lit)
    }
}

/// Finds an object property whose value is a function returning
/// `[ ...literals ][...]`, with every element statically known.
#[derive(Default)]
struct FindTableVisitor {
    found: Option<(String, Vec<Lit>)>
}

impl Visit for FindTableVisitor {
    fn visit_key_value_prop(&mut self, prop: &KeyValueProp) {
        if self.found.is_some() {
            return;
        }

        if let Expr::Fn(fn_expr) = unparen(&prop.value) {
            if let Some(array) = returned_array(&fn_expr.function) {
                if let Some(values) = fold_elements(array) {
                    self.found = Some((prop_name(&prop.key), values));
                    return;
                }
            }
        }

        prop.visit_children_with(self);
    }
}

/// Looks for `return [ ... ][ ... ];` in the function's own body, without
/// crossing into nested functions.
fn returned_array(function: &Function) -> Option<&ArrayLit> {
    let body = function.body.as_ref()?;
    returned_array_in_stmts(&body.stmts)
}

fn returned_array_in_stmts(stmts: &[Stmt]) -> Option<&ArrayLit> {
    stmts.iter().find_map(returned_array_in_stmt)
}

fn returned_array_in_stmt(stmt: &Stmt) -> Option<&ArrayLit> {
    match stmt {
        Stmt::Return(ret) => {
            if let Expr::Member(member) = unparen(ret.arg.as_deref()?) {
                if let Expr::Array(array) = unparen(&member.obj) {
                    return Some(array);
                }
            }
            None
        }
        Stmt::Block(block) => returned_array_in_stmts(&block.stmts),
        Stmt::If(if_stmt) => returned_array_in_stmt(&if_stmt.cons)
            .or_else(|| if_stmt.alt.as_deref().and_then(returned_array_in_stmt)),
        _ => None
    }
}

/// Folds every array element; any element that isn't statically known
/// rejects the candidate.
fn fold_elements(array: &ArrayLit) -> Option<Vec<Lit>> {
    let mut values = Vec::with_capacity(array.elems.len());
    for elem in &array.elems {
        let elem = elem.as_ref()?;
        if elem.spread.is_some() {
            return None;
        }
        values.push(eval::fold_expr(&elem.expr)?);
    }
    Some(values)
}

fn left_as_expr(left: &PatOrExpr) -> Option<Expr> {
    match left {
        PatOrExpr::Expr(expr) => Some((**expr).clone()),
        PatOrExpr::Pat(pat) => match &**pat {
            Pat::Ident(binding) => Some(Expr::Ident(binding.id.clone())),
            Pat::Expr(expr) => Some((**expr).clone()),
            _ => None
        }
    }
}

fn prop_name(key: &PropName) -> String {
    match key {
        PropName::Ident(id) => id.sym.to_string(),
        PropName::Str(s) => s.value.to_string(),
        PropName::Num(n) => n.value.to_string(),
        PropName::BigInt(b) => b.value.to_string(),
        PropName::Computed(_) => String::from("[computed]")
    }
}

/// Short, human-readable rendering of an identifier or member path, for
/// the trace.
fn expr_desc(expr: &Expr) -> String {
    match expr {
        Expr::Ident(id) => id.sym.to_string(),
        Expr::Member(member) => {
            let obj = expr_desc(&member.obj);
            match &member.prop {
                MemberProp::Ident(id) => format!("{}.{}", obj, id.sym),
                _ => format!("{}[..]", obj)
            }
        }
        _ => String::from("<expr>")
    }
}

fn unparen(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(paren) => unparen(&paren.expr),
        _ => expr
    }
}

/// Removes the statements that enclose the recorded assignment spans.
struct RemoveStmtsVisitor {
    spans: Vec<Span>
}

impl VisitMut for RemoveStmtsVisitor {
    fn visit_mut_stmt(&mut self, stmt: &mut Stmt) {
        stmt.visit_mut_children_with(self);

        if let Stmt::Expr(expr_stmt) = stmt {
            let span = expr_stmt.span();
            if self
                .spans
                .iter()
                .any(|s| span.lo <= s.lo && s.hi <= span.hi)
            {
                stmt.take();
            }
        }
    }

    // Remove empty statements
    fn visit_mut_stmts(&mut self, stmts: &mut Vec<Stmt>) {
        stmts.visit_mut_children_with(self);

        stmts.retain(|s| !matches!(s, Stmt::Empty(..)));
    }

    // Remove empty ModuleItem's
    fn visit_mut_module_items(&mut self, stmts: &mut Vec<ModuleItem>) {
        stmts.visit_mut_children_with(self);
        stmts.retain(|stmt| !matches!(stmt, ModuleItem::Stmt(Stmt::Empty(..))));
    }
}
