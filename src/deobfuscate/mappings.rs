use std::collections::HashMap;
use std::default::Default;
use swc_core::common::DUMMY_SP;
use swc_core::ecma::ast::{
    CallExpr, Callee, Expr, Ident, Lit, MemberExpr, MemberProp, Program
};
use swc_core::ecma::atoms::JsWord;
use swc_core::ecma::visit::{VisitMut, VisitMutWith};

use crate::trace::Trace;

/// The two dispatcher helpers the obfuscator uses to register aliases
/// for built-in globals.
const DISPATCHER_NAMES: [&str; 2] = ["M6J", "f8D"];

/// The namespace object aliases are looked up on.
const DISPATCH_NAMESPACE: &str = "i";

/// Short names the dispatcher passes for well-known globals.
const GLOBAL_SHORT_NAMES: [(&str, &str); 5] = [
    ("k2K", "String"),
    ("z4k", "window"),
    ("R9p", "Math"),
    ("c5G", "Array"),
    ("h1G", "RegExp")
];

/// Free functions that live on `window`; a mapping to one of these is
/// window-scoped regardless of its base object.
const AMBIENT_FUNCTIONS: [&str; 6] = ["atob", "btoa", "parseInt", "parseFloat", "isNaN", "isFinite"];

/// Resolves calls routed through the dispatch-table indirection back to
/// canonical global references. No-op when no dispatcher calls exist.
pub struct Visitor {
    trace: Trace
}

impl Visitor {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

#[derive(Clone)]
struct Mapping {
    base: String,
    method: String,

    /// `method` when window-scoped, `base.method` otherwise. Trace only.
    full_path: String
}

impl VisitMut for Visitor {
    fn visit_mut_program(&mut self, program: &mut Program) {
        let mut discover = DiscoverVisitor {
            trace: self.trace.clone(),
            mappings: HashMap::new()
        };
        program.visit_mut_children_with(&mut discover);

        if discover.mappings.is_empty() {
            self.trace.log("[mappings] no dispatcher registrations found");
            return;
        }
        self.trace.log(format!(
            "[mappings] resolving {} mapping(s)",
            discover.mappings.len()
        ));

        let mut rewrite = RewriteVisitor {
            trace: self.trace.clone(),
            mappings: discover.mappings
        };
        program.visit_mut_children_with(&mut rewrite);
    }
}

/// Collects alias registrations from dispatcher calls. A later
/// registration for the same alias overwrites the earlier one.
struct DiscoverVisitor {
    trace: Trace,
    mappings: HashMap<String, Mapping>
}

impl DiscoverVisitor {
    fn record(&mut self, call: &CallExpr) {
        let callee = match &call.callee {
            Callee::Expr(callee) => callee,
            _ => return
        };
        let name = match &**callee {
            Expr::Ident(id) => id.sym.as_ref(),
            _ => return
        };
        if !DISPATCHER_NAMES.contains(&name) || call.args.len() < 4 {
            return;
        }
        if call.args.iter().take(4).any(|arg| arg.spread.is_some()) {
            return;
        }

        let method = match &*call.args[1].expr {
            Expr::Lit(Lit::Str(s)) => s.value.to_string(),
            _ => return
        };
        let alias = match &*call.args[3].expr {
            Expr::Lit(Lit::Str(s)) => s.value.to_string(),
            _ => return
        };
        // Unresolved short names pass through as the base itself
        let base = match &*call.args[0].expr {
            Expr::Ident(id) => GLOBAL_SHORT_NAMES
                .iter()
                .find(|(short, _)| *short == id.sym.as_ref())
                .map(|(_, canonical)| canonical.to_string())
                .unwrap_or_else(|| id.sym.to_string()),
            _ => return
        };
        if method.is_empty() {
            return;
        }

        let is_window = base == "window" || AMBIENT_FUNCTIONS.contains(&method.as_str());
        let mapping = Mapping {
            base: if is_window {
                String::from("window")
            } else {
                base.clone()
            },
            full_path: if is_window {
                method.clone()
            } else {
                format!("{}.{}", base, method)
            },
            method
        };
        self.trace.log(format!(
            "[mappings] found mapping: {}.{} -> {}",
            DISPATCH_NAMESPACE, alias, mapping.full_path
        ));
        self.mappings.insert(alias, mapping);
    }
}

impl VisitMut for DiscoverVisitor {
    fn visit_mut_call_expr(&mut self, call: &mut CallExpr) {
        self.record(call);
        call.visit_mut_children_with(self);
    }
}

/// Rewrites the supported alias shapes. Anything else is intentionally
/// left unresolved.
struct RewriteVisitor {
    trace: Trace,
    mappings: HashMap<String, Mapping>
}

impl VisitMut for RewriteVisitor {
    fn visit_mut_call_expr(&mut self, call: &mut CallExpr) {
        if let Callee::Expr(callee) = &mut call.callee {
            match &mut **callee {
                // i.alias(...) — only rewritten in call position
                Expr::Member(member) => {
                    if let Some(replacement) = self.member_replacement(member) {
                        **callee = replacement;
                    }
                }
                // alias(...)
                Expr::Ident(id) => {
                    if let Some(mapping) = self.mappings.get(id.sym.as_ref()) {
                        if mapping.base == "window" {
                            self.trace.log(format!(
                                "[mappings] replaced {}() -> {}()",
                                id.sym, mapping.method
                            ));
                            **callee = Expr::Ident(Ident::new(
                                JsWord::from(mapping.method.as_str()),
                                DUMMY_SP
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        call.visit_mut_children_with(self);
    }
}

impl RewriteVisitor {
    fn member_replacement(&self, member: &MemberExpr) -> Option<Expr> {
        match &*member.obj {
            Expr::Ident(id) if id.sym.as_ref() == DISPATCH_NAMESPACE => {}
            _ => return None
        }
        let alias = match &member.prop {
            MemberProp::Ident(id) => id.sym.clone(),
            _ => return None
        };
        let mapping = self.mappings.get(alias.as_ref())?;

        if mapping.base == "String" && mapping.method == "fromCharCode" {
            self.trace.log(format!(
                "[mappings] replaced {}.{}() -> String.fromCharCode()",
                DISPATCH_NAMESPACE, alias
            ));
            Some(canonical_member("String", "fromCharCode"))
        } else if mapping.base == "Math" && mapping.method == "random" {
            self.trace.log(format!(
                "[mappings] replaced {}.{}() -> Math.random()",
                DISPATCH_NAMESPACE, alias
            ));
            Some(canonical_member("Math", "random"))
        } else if mapping.base == "window" {
            self.trace.log(format!(
                "[mappings] replaced {}.{} -> {}",
                DISPATCH_NAMESPACE, alias, mapping.method
            ));
            Some(Expr::Ident(Ident::new(
                JsWord::from(mapping.method.as_str()),
                DUMMY_SP
            )))
        } else {
            None
        }
    }
}

fn canonical_member(obj: &str, prop: &str) -> Expr {
    Expr::Member(MemberExpr {
        span: DUMMY_SP,
        obj: Box::new(Expr::Ident(Ident::new(JsWord::from(obj), DUMMY_SP))),
        prop: MemberProp::Ident(Ident::new(JsWord::from(prop), DUMMY_SP))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn run_pass(source: &str) -> (String, Vec<String>) {
        testing::with_globals(|| {
            let (cm, mut program) = testing::parse_program(source);
            let trace = Trace::new();
            let mut visitor = Visitor::new(trace.clone());
            program.visit_mut_with(&mut visitor);
            (testing::emit(&cm, &program), trace.lines())
        })
    }

    const FIXTURE: &str = concat!(
        "M6J(k2K, \"fromCharCode\", 0, \"fc\");\n",
        "M6J(R9p, \"random\", 0, \"rnd\");\n",
        "M6J(R9p, \"floor\", 0, \"flr\");\n",
        "f8D(z4k, \"open\", 0, \"op\");\n",
        "M6J(q9q, \"parseInt\", 0, \"pi\");\n",
        "log(i.fc(65));\n",
        "log(i.rnd());\n",
        "log(i.op(\"x\"));\n",
        "log(i.flr(1.5));\n",
        "pi(\"42\");\n"
    );

    #[test]
    fn resolves_supported_shapes() {
        let (output, _) = run_pass(FIXTURE);
        assert!(output.contains("String.fromCharCode(65)"));
        assert!(output.contains("Math.random()"));
        // window-scoped members become bare identifiers
        assert!(output.contains("open(\"x\")"));
        // bare alias calls to window functions are rewritten
        assert!(output.contains("parseInt(\"42\")"));
    }

    #[test]
    fn unsupported_combinations_stay_unresolved() {
        let (output, _) = run_pass(FIXTURE);
        // Math.floor isn't one of the supported rewrites
        assert!(output.contains("i.flr(1.5)"));
    }

    #[test]
    fn ambient_functions_are_window_scoped() {
        // The base q9q is unknown, but parseInt is on the ambient list
        let (_, trace) = run_pass(FIXTURE);
        assert!(trace.iter().any(|l| l.contains("i.pi -> parseInt")));
    }

    #[test]
    fn members_outside_call_position_are_left_alone() {
        let source = concat!(
            "M6J(z4k, \"open\", 0, \"op\");\n",
            "var w = i.op;\n"
        );
        let (output, _) = run_pass(source);
        assert!(output.contains("i.op"));
    }

    #[test]
    fn later_registrations_overwrite_earlier_ones() {
        let source = concat!(
            "M6J(R9p, \"random\", 0, \"x\");\n",
            "M6J(z4k, \"open\", 0, \"x\");\n",
            "i.x();\n"
        );
        let (output, _) = run_pass(source);
        assert!(output.contains("open()"));
        assert!(!output.contains("Math.random"));
    }

    #[test]
    fn no_dispatcher_calls_is_a_no_op() {
        let source = "log(i.fc(65));\n";
        let (output, trace) = run_pass(source);
        assert!(output.contains("i.fc(65)"));
        assert!(trace.iter().any(|l| l.contains("no dispatcher registrations")));
    }
}
