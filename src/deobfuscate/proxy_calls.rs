use std::collections::{HashMap, HashSet};
use std::default::Default;
use std::fmt::{Display, Formatter};
use swc_core::common::util::take::Take;
use swc_core::common::EqIgnoreSpan;
use swc_core::ecma::ast::{
    AssignExpr, Callee, Expr, Lit, MemberExpr, MemberProp, ModuleItem, op, Pat, PatOrExpr,
    Program, Stmt, VarDeclarator
};
use swc_core::ecma::atoms::JsWord;
use swc_core::ecma::visit::{VisitMut, VisitMutWith};

use crate::trace::Trace;

/// Removes the guarded indirection-wrapper calling convention.
///
/// The obfuscator stores wrappers of the shape
///
/// ```js
/// p.key = function () {
///     return typeof o.m === "function" ? o.m.apply(o, arguments) : o.m;
/// };
/// ```
///
/// on one heavily-used "proxy" object, then routes calls through
/// `p.key(...)`. This pass picks the base object by wrapper-assignment
/// frequency, follows simple aliases of it, records each wrapper's real
/// target, deletes the dead wrapper assignments and rewrites the routed
/// calls to call the target directly. Absence of the pattern is a normal
/// outcome.
pub struct Visitor {
    trace: Trace
}

impl Visitor {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

impl VisitMut for Visitor {
    fn visit_mut_program(&mut self, program: &mut Program) {
        let mut scan = FrequencyVisitor::default();
        program.visit_mut_children_with(&mut scan);

        let base = match select_base(&scan.counts) {
            Some(v) => v,
            None => {
                self.trace.log("[proxy] no wrapper functions found");
                return;
            }
        };
        self.trace.log(format!("[proxy] base object is \"{}\"", base));

        let mut aliases = HashSet::new();
        aliases.insert(base);
        let mut rewrite = RewriteVisitor {
            trace: self.trace.clone(),
            aliases,
            wrappers: HashMap::new()
        };
        program.visit_mut_children_with(&mut rewrite);

        // Sweep the statements holding removed wrapper assignments
        let mut sweep = SweepVisitor;
        program.visit_mut_children_with(&mut sweep);
        self.trace.log("[proxy] inlining complete");
    }
}

/// Tallies wrapper-shaped assignments per base identifier, in first-seen
/// order.
#[derive(Default)]
struct FrequencyVisitor {
    counts: Vec<(JsWord, usize)>
}

impl VisitMut for FrequencyVisitor {
    fn visit_mut_assign_expr(&mut self, assign: &mut AssignExpr) {
        assign.visit_mut_children_with(self);

        if let Some(member) = member_target(&assign.left) {
            if let Expr::Ident(obj) = &*member.obj {
                if wrapper_target(&assign.right).is_some() {
                    match self.counts.iter_mut().find(|(name, _)| *name == obj.sym) {
                        Some((_, count)) => *count += 1,
                        None => self.counts.push((obj.sym.clone(), 1))
                    }
                }
            }
        }
    }
}

/// Picks the base with the strictly highest count; on a tie the base seen
/// first wins.
fn select_base(counts: &[(JsWord, usize)]) -> Option<JsWord> {
    let mut best: Option<(&JsWord, usize)> = None;
    for (name, count) in counts {
        let beats = match best {
            Some((_, best_count)) => *count > best_count,
            None => true
        };
        if beats {
            best = Some((name, *count));
        }
    }
    best.map(|(name, _)| name.clone())
}

/// A wrapper-table key. String-ish keys and numeric keys never collide,
/// mirroring how the obfuscated code distinguishes `p["5"]` from `p[5]`.
#[derive(Clone, PartialEq, Eq, Hash)]
enum MemberKey {
    Name(JsWord),
    Index(u64)
}

impl Display for MemberKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{}", name),
            Self::Index(bits) => write!(f, "{}", f64::from_bits(*bits))
        }
    }
}

fn member_key(member: &MemberExpr) -> Option<MemberKey> {
    match &member.prop {
        MemberProp::Ident(id) => Some(MemberKey::Name(id.sym.clone())),
        MemberProp::Computed(computed) => match &*computed.expr {
            Expr::Lit(Lit::Str(s)) => Some(MemberKey::Name(s.value.clone())),
            Expr::Lit(Lit::Num(n)) => Some(MemberKey::Index(n.value.to_bits())),
            _ => None
        },
        _ => None
    }
}

/// Collects aliases of the base object, builds the wrapper table while
/// deleting the now-dead assignments, and rewrites routed calls.
/// Everything happens in one walk, so only constructs appearing after
/// their prerequisites are affected; in particular alias links are
/// single-hop and order-sensitive.
struct RewriteVisitor {
    trace: Trace,
    aliases: HashSet<JsWord>,
    wrappers: HashMap<MemberKey, MemberExpr>
}

impl VisitMut for RewriteVisitor {
    fn visit_mut_var_declarator(&mut self, declarator: &mut VarDeclarator) {
        if let (Pat::Ident(name), Some(init)) = (&declarator.name, &declarator.init) {
            if let Expr::Ident(src) = &**init {
                if self.aliases.contains(&src.sym) {
                    self.aliases.insert(name.id.sym.clone());
                }
            }
        }
        declarator.visit_mut_children_with(self);
    }

    fn visit_mut_expr(&mut self, expr: &mut Expr) {
        expr.visit_mut_children_with(self);

        if let Expr::Assign(assign) = expr {
            if let Some((key, target)) = self.match_wrapper_assignment(assign) {
                self.trace.log(format!(
                    "[proxy] wrapper \"{}\" targets {}",
                    key,
                    member_desc(&target)
                ));
                self.wrappers.insert(key, target);
                // The wrapper definition is dead once the table holds
                // its target
                expr.take();
            }
        } else if let Expr::Call(call) = expr {
            if let Callee::Expr(callee) = &call.callee {
                if let Expr::Member(member) = &**callee {
                    if let Expr::Ident(obj) = &*member.obj {
                        if self.aliases.contains(&obj.sym) {
                            if let Some(target) = member_key(member)
                                .and_then(|key| self.wrappers.get(&key))
                            {
                                self.trace.log(format!(
                                    "[proxy] inlining call through \"{}\" to {}",
                                    obj.sym,
                                    member_desc(target)
                                ));
                                call.callee =
                                    Callee::Expr(Box::new(Expr::Member(target.clone())));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl RewriteVisitor {
    fn match_wrapper_assignment(&self, assign: &AssignExpr) -> Option<(MemberKey, MemberExpr)> {
        let member = member_target(&assign.left)?;
        match &*member.obj {
            Expr::Ident(obj) if self.aliases.contains(&obj.sym) => {}
            _ => return None
        }
        let target = wrapper_target(&assign.right)?;
        let key = member_key(member)?;
        Some((key, target.clone()))
    }
}

/// Tests the wrapper shape: a function whose body is exactly
/// `return typeof T === "function" ? T.apply(O, arguments) : T;` where
/// `T` is a member access `O.method`. Returns the target `T` on a match.
fn wrapper_target(expr: &Expr) -> Option<&MemberExpr> {
    let fn_expr = match unparen(expr) {
        Expr::Fn(f) => f,
        _ => return None
    };
    let body = fn_expr.function.body.as_ref()?;
    if body.stmts.len() != 1 {
        return None;
    }
    let ret = match &body.stmts[0] {
        Stmt::Return(ret) => ret,
        _ => return None
    };
    let cond = match unparen(ret.arg.as_deref()?) {
        Expr::Cond(c) => c,
        _ => return None
    };

    // typeof T === "function"
    let test = match unparen(&cond.test) {
        Expr::Bin(b) if b.op == op!("===") => b,
        _ => return None
    };
    let unary = match unparen(&test.left) {
        Expr::Unary(u) if u.op == op!("typeof") => u,
        _ => return None
    };
    match unparen(&test.right) {
        Expr::Lit(Lit::Str(s)) if s.value.as_ref() == "function" => {}
        _ => return None
    }
    let target = match unparen(&unary.arg) {
        Expr::Member(m) => m,
        _ => return None
    };

    // The fallback branch returns the target itself
    match unparen(&cond.alt) {
        Expr::Member(alt) if target.eq_ignore_span(alt) => {}
        _ => return None
    }

    // T.apply(O, arguments)
    let call = match unparen(&cond.cons) {
        Expr::Call(c) => c,
        _ => return None
    };
    let callee = match &call.callee {
        Callee::Expr(callee) => match unparen(callee) {
            Expr::Member(m) => m,
            _ => return None
        },
        _ => return None
    };
    match &callee.prop {
        MemberProp::Ident(id) if id.sym.as_ref() == "apply" => {}
        _ => return None
    }
    match unparen(&callee.obj) {
        Expr::Member(obj) if target.eq_ignore_span(obj) => {}
        _ => return None
    }
    if call.args.len() != 2 || call.args.iter().any(|arg| arg.spread.is_some()) {
        return None;
    }
    match unparen(&call.args[0].expr) {
        first if first.eq_ignore_span(&target.obj) => {}
        _ => return None
    }
    match unparen(&call.args[1].expr) {
        Expr::Ident(id) if id.sym.as_ref() == "arguments" => {}
        _ => return None
    }

    Some(target)
}

fn member_target(left: &PatOrExpr) -> Option<&MemberExpr> {
    let expr = match left {
        PatOrExpr::Expr(expr) => expr,
        PatOrExpr::Pat(pat) => match &**pat {
            Pat::Expr(expr) => expr,
            _ => return None
        }
    };
    match &**expr {
        Expr::Member(member) => Some(member),
        _ => None
    }
}

fn member_desc(member: &MemberExpr) -> String {
    let obj = match &*member.obj {
        Expr::Ident(id) => id.sym.to_string(),
        _ => String::from("<expr>")
    };
    match &member.prop {
        MemberProp::Ident(id) => format!("{}.{}", obj, id.sym),
        _ => format!("{}[..]", obj)
    }
}

fn unparen(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(paren) => unparen(&paren.expr),
        _ => expr
    }
}

/// Removes statements whose expression was invalidated and empty
/// statements left behind by the removal.
struct SweepVisitor;

impl VisitMut for SweepVisitor {
    fn visit_mut_stmt(&mut self, s: &mut Stmt) {
        s.visit_mut_children_with(self);

        if let Stmt::Expr(expr_stmt) = s {
            if matches!(&*expr_stmt.expr, Expr::Invalid(..)) {
                s.take();
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

    // Remove invalid expressions
    fn visit_mut_exprs(&mut self, exprs: &mut Vec<Box<Expr>>) {
        exprs.visit_mut_children_with(self);
        exprs.retain(|expr| !matches!(**expr, Expr::Invalid(..)));
    }
}
