use std::default::Default;
use swc_core::common::util::take::Take;
use swc_core::common::{Span, Spanned, DUMMY_SP};
use swc_core::ecma::ast::{
    ArrayLit, AssignExpr, BinExpr, BindingIdent, BlockStmt, CallExpr, Callee, ComputedPropName,
    Decl, Expr, ExprOrSpread, FnDecl, FnExpr, Function, Ident, KeyValueProp, Lit, MemberExpr,
    MemberProp, ModuleItem, op, Param, Pat, Program, PropName, ReturnStmt, Stmt
};
use swc_core::ecma::atoms::JsWord;
use swc_core::ecma::visit::{Visit, VisitMut, VisitMutWith, VisitWith};

use crate::trace::Trace;
use crate::DecodeFailure;

/// Minimum length of the encoded payload string. Anything shorter is
/// assumed to be an ordinary string constant.
const MIN_PAYLOAD_CHARS: usize = 500;

/// Rebuilds the obfuscated string table.
///
/// The table ships as one huge percent-encoded, XOR-ciphered string inside
/// a function declaration, and a keyed decoder IIFE assigned to an object
/// property. This pass decodes the table statically and swaps the decoder
/// for a plain accessor over the literal array.
///
/// Unlike the other passes, failure here is fatal: the rest of the
/// pipeline assumes a literal string table exists. The outcome is recorded
/// in [Visitor::failure] and read by the pipeline driver; on failure the
/// tree is left completely untouched.
pub struct Visitor {
    trace: Trace,

    /// The fatal outcome of this pass, if any.
    pub failure: Option<DecodeFailure>
}

impl Visitor {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            failure: None
        }
    }
}

impl VisitMut for Visitor {
    fn visit_mut_program(&mut self, program: &mut Program) {
        // Discovery first, in two read-only scans. The tree is only
        // mutated once everything needed for decoding has been found.
        let mut find_payload = FindPayloadVisitor::default();
        program.visit_mut_children_with(&mut find_payload);
        let payload = match find_payload.found {
            Some(v) => v,
            None => {
                self.trace.log("[string-array] payload function not found, aborting");
                self.failure = Some(DecodeFailure::MissingLargeString);
                return;
            }
        };
        self.trace.log(format!(
            "[string-array] found payload function \"{}\" ({} chars)",
            payload.name,
            payload.text.chars().count()
        ));

        let mut find_decoder = FindDecoderVisitor::default();
        program.visit_mut_children_with(&mut find_decoder);
        let decoder = match find_decoder.found {
            Some(v) => v,
            None => {
                self.trace.log("[string-array] decoder not found, aborting");
                self.failure = Some(DecodeFailure::MissingDecoder);
                return;
            }
        };
        self.trace.log(format!(
            "[string-array] found decoder on property \"{}\" with {} shuffle op(s)",
            decoder.prop_name,
            decoder.ops.len()
        ));
        if decoder.ops.is_empty() {
            self.trace.log("[string-array] no shuffle operations extracted, aborting");
            self.failure = Some(DecodeFailure::NoShuffleOps);
            return;
        }

        let strings = match decode_payload(&payload.text, &decoder.key, decoder.separator, &decoder.ops) {
            Ok(v) => v,
            Err(e) => {
                self.trace.log(format!("[string-array] {}, aborting", e));
                self.failure = Some(e);
                return;
            }
        };
        self.trace.log(format!("[string-array] decoded table with {} strings", strings.len()));

        // Commit: swap the decoder for a literal accessor and drop the
        // payload function.
        let mut apply = ApplyVisitor {
            decoder_value_span: decoder.value_span,
            payload_fn_span: payload.fn_span,
            accessor: Some(accessor_fn(&strings))
        };
        program.visit_mut_children_with(&mut apply);
        self.trace.log("[string-array] installed literal accessor, removed payload function");
    }
}

/// The recorded payload function.
struct PayloadInfo {
    /// The percent-encoded payload text.
    text: String,

    /// The function's name, for the trace.
    name: JsWord,

    /// Span of the function's identifier, used to find the declaration
    /// again when removing it.
    fn_span: Span
}

/// Finds the first function declaration whose body is exactly one
/// `return "<long string>";`.
#[derive(Default)]
struct FindPayloadVisitor {
    found: Option<PayloadInfo>
}

impl VisitMut for FindPayloadVisitor {
    fn visit_mut_fn_decl(&mut self, fn_decl: &mut FnDecl) {
        // First match wins
        if self.found.is_some() {
            return;
        }

        if let Some(text) = payload_string(&fn_decl.function) {
            self.found = Some(PayloadInfo {
                text,
                name: fn_decl.ident.sym.clone(),
                fn_span: fn_decl.ident.span
            });
            return;
        }

        fn_decl.visit_mut_children_with(self);
    }
}

/// Returns the returned string if the function body is exactly one return
/// of a string literal of at least [MIN_PAYLOAD_CHARS] characters.
fn payload_string(function: &Function) -> Option<String> {
    let body = function.body.as_ref()?;
    if body.stmts.len() != 1 {
        return None;
    }
    if let Stmt::Return(ret) = &body.stmts[0] {
        if let Expr::Lit(Lit::Str(s)) = unparen(ret.arg.as_deref()?) {
            let value = s.value.to_string();
            if value.chars().count() >= MIN_PAYLOAD_CHARS {
                return Some(value);
            }
        }
    }
    None
}

/// One extract-and-prepend reorder step, read out of the decoder body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleOp {
    pub s1_offset: i64,
    pub s1_length: i64,
    pub s2_offset: i64,
    pub s2_length: i64
}

/// The recorded decoder.
struct DecoderInfo {
    /// The XOR cipher key.
    key: String,

    /// The single-character join separator.
    separator: char,

    /// Shuffle operations, in source order.
    ops: Vec<ShuffleOp>,

    /// Span of the property's value (the decoder IIFE call), used to find
    /// the property again when replacing it.
    value_span: Span,

    /// The property's name, for the trace.
    prop_name: String
}

/// Finds the first object property whose value is a call to a function
/// expression with a single string-literal argument, where the callee
/// looks like the table decoder.
#[derive(Default)]
struct FindDecoderVisitor {
    found: Option<DecoderInfo>
}

impl VisitMut for FindDecoderVisitor {
    fn visit_mut_key_value_prop(&mut self, prop: &mut KeyValueProp) {
        // First match wins
        if self.found.is_some() {
            return;
        }

        if let Some(info) = match_decoder(prop) {
            self.found = Some(info);
            return;
        }

        prop.visit_mut_children_with(self);
    }
}

fn match_decoder(prop: &KeyValueProp) -> Option<DecoderInfo> {
    let call = match unparen(&prop.value) {
        Expr::Call(call) => call,
        _ => return None
    };
    let fn_expr = match &call.callee {
        Callee::Expr(callee) => match unparen(callee) {
            Expr::Fn(f) => f,
            _ => return None
        },
        _ => return None
    };
    if call.args.len() != 1 || call.args[0].spread.is_some() {
        return None;
    }
    let key = match &*call.args[0].expr {
        Expr::Lit(Lit::Str(s)) => s.value.to_string(),
        _ => return None
    };

    // The callee qualifies as a decoder if it XORs somewhere and splits
    // on a single-character separator somewhere.
    let mut qualify = QualifyVisitor::default();
    fn_expr.function.visit_with(&mut qualify);
    if !qualify.has_xor {
        return None;
    }
    let separator = qualify.separator?;

    let mut extract = OpsVisitor::default();
    fn_expr.function.visit_with(&mut extract);

    Some(DecoderInfo {
        key,
        separator,
        ops: extract.ops,
        value_span: prop.value.span(),
        prop_name: prop_name(&prop.key)
    })
}

/// Checks the two decoder markers: a bitwise-XOR binary expression, and a
/// two-argument call whose second argument is a single-character string
/// literal, consumed by an assignment. That character is the separator;
/// later matches overwrite earlier ones.
#[derive(Default)]
struct QualifyVisitor {
    assign_depth: usize,
    has_xor: bool,
    separator: Option<char>
}

impl Visit for QualifyVisitor {
    fn visit_assign_expr(&mut self, assign: &AssignExpr) {
        self.assign_depth += 1;
        assign.visit_children_with(self);
        self.assign_depth -= 1;
    }

    fn visit_bin_expr(&mut self, bin: &BinExpr) {
        if bin.op == op!("^") {
            self.has_xor = true;
        }
        bin.visit_children_with(self);
    }

    fn visit_call_expr(&mut self, call: &CallExpr) {
        if self.assign_depth > 0
            && call.args.len() == 2
            && call.args.iter().all(|arg| arg.spread.is_none())
        {
            if let Expr::Lit(Lit::Str(s)) = &*call.args[1].expr {
                let value = s.value.to_string();
                let mut chars = value.chars();
                if let (Some(c), None) = (chars.next(), chars.next()) {
                    self.separator = Some(c);
                }
            }
        }
        call.visit_children_with(self);
    }
}

/// Extracts shuffle parameter tuples `(n1, n2), n3, n4` from call
/// argument lists: an inner call with exactly two numeric arguments,
/// immediately followed by two more numeric arguments. The first three
/// numbers may be negated; the fourth never is.
#[derive(Default)]
struct OpsVisitor {
    ops: Vec<ShuffleOp>
}

impl Visit for OpsVisitor {
    fn visit_call_expr(&mut self, call: &CallExpr) {
        let args = &call.args;
        let mut i = 0;
        while i < args.len() {
            if let Some(op) = tuple_at(args, i) {
                self.ops.push(op);
                // The window is consumed, the next one can't overlap it
                i += 3;
            } else {
                i += 1;
            }
        }
        call.visit_children_with(self);
    }
}

fn tuple_at(args: &[ExprOrSpread], i: usize) -> Option<ShuffleOp> {
    let first = args.get(i)?;
    if first.spread.is_some() {
        return None;
    }
    let inner = match unparen(&first.expr) {
        Expr::Call(call) => call,
        _ => return None
    };
    if inner.args.len() != 2 || inner.args.iter().any(|arg| arg.spread.is_some()) {
        return None;
    }
    let s1_offset = numeric_value(&inner.args[0].expr)?;
    let s1_length = numeric_value(&inner.args[1].expr)?;

    let third = args.get(i + 1)?;
    if third.spread.is_some() {
        return None;
    }
    let s2_offset = numeric_value(&third.expr)?;

    let fourth = args.get(i + 2)?;
    if fourth.spread.is_some() {
        return None;
    }
    let s2_length = match &*fourth.expr {
        Expr::Lit(Lit::Num(n)) => n.value,
        _ => return None
    };

    Some(ShuffleOp {
        s1_offset: s1_offset as i64,
        s1_length: s1_length as i64,
        s2_offset: s2_offset as i64,
        s2_length: s2_length as i64
    })
}

/// Reads a numeric literal, allowing a unary minus.
fn numeric_value(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Lit(Lit::Num(n)) => Some(n.value),
        Expr::Unary(unary) if unary.op == op!(unary, "-") => match &*unary.arg {
            Expr::Lit(Lit::Num(n)) => Some(-n.value),
            _ => None
        },
        _ => None
    }
}

/// Strips parentheses.
fn unparen(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(paren) => unparen(&paren.expr),
        _ => expr
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

/// Runs the decoding algorithm: percent-decode, XOR with the key, split
/// on the separator, then replay the shuffle operations in order.
pub fn decode_payload(
    payload: &str,
    key: &str,
    separator: char,
    ops: &[ShuffleOp]
) -> Result<Vec<String>, DecodeFailure> {
    let decoded = percent_decode(payload)
        .ok_or_else(|| DecodeFailure::MalformedPayload(String::from("invalid percent-encoding")))?;

    let key_chars: Vec<char> = key.chars().collect();
    let plaintext = if key_chars.is_empty() {
        decoded
    } else {
        let mut out = String::with_capacity(decoded.len());
        for (i, c) in decoded.chars().enumerate() {
            let k = key_chars[i % key_chars.len()];
            let code = (c as u32) ^ (k as u32);
            match char::from_u32(code) {
                Some(p) => out.push(p),
                None => {
                    return Err(DecodeFailure::MalformedPayload(format!(
                        "XOR produced invalid code point {:#x}",
                        code
                    )))
                }
            }
        }
        out
    };

    let mut items: Vec<String> = plaintext.split(separator).map(String::from).collect();
    for op in ops {
        // Each step mutates the output of the previous one: pull out
        // slice 1, pull slice 2 out of *it*, and move slice 2 to the
        // front. Whatever slice 1 held beyond slice 2 is dropped.
        let mut removed = splice_off(&mut items, op.s1_offset, op.s1_length);
        let lead = splice_off(&mut removed, op.s2_offset, op.s2_length);
        items.splice(0..0, lead);
    }
    Ok(items)
}

/// `Array.prototype.splice(start, deleteCount)` with JavaScript's index
/// normalization: a negative start counts from the end, and both values
/// are clamped to the available range. Removes and returns the range.
fn splice_off(items: &mut Vec<String>, start: i64, delete_count: i64) -> Vec<String> {
    let len = items.len() as i64;
    let start = if start < 0 {
        (len + start).max(0)
    } else {
        start.min(len)
    };
    let count = delete_count.max(0).min(len - start);
    items
        .splice(start as usize..(start + count) as usize, std::iter::empty())
        .collect()
}

/// Decodes `%XX` escapes, leaving other bytes alone, and validates the
/// result as UTF-8.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = (*bytes.get(i + 1)? as char).to_digit(16)?;
            let lo = (*bytes.get(i + 2)? as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Builds `function (index) { return [ ...strings ][index]; }`.
fn accessor_fn(strings: &[String]) -> Expr {
    let elems = strings
        .iter()
        .map(|s| {
            Some(ExprOrSpread {
                spread: None,
                expr: Box::new(Expr::Lit(Lit::Str(JsWord::from(s.as_str()).into())))
            })
        })
        .collect();
    let array = Expr::Array(ArrayLit {
        span: DUMMY_SP,
        elems
    });

    let index = Ident::new(JsWord::from("index"), DUMMY_SP);
    let body = Stmt::Return(ReturnStmt {
        span: DUMMY_SP,
        arg: Some(Box::new(Expr::Member(MemberExpr {
            span: DUMMY_SP,
            obj: Box::new(array),
            prop: MemberProp::Computed(ComputedPropName {
                span: DUMMY_SP,
                expr: Box::new(Expr::Ident(index.clone()))
            })
        })))
    });

    Expr::Fn(FnExpr {
        ident: None,
        function: Box::new(Function {
            params: vec![Param {
                span: DUMMY_SP,
                decorators: Vec::new(),
                pat: Pat::Ident(BindingIdent {
                    id: index,
                    type_ann: None
                })
            }],
            decorators: Vec::new(),
            span: DUMMY_SP,
            body: Some(BlockStmt {
                span: DUMMY_SP,
                stmts: vec![body]
            }),
            is_generator: false,
            is_async: false,
            type_params: None,
            return_type: None
        })
    })
}

/// Applies the decoded table to the tree: installs the accessor over the
/// decoder property and removes the payload function, then sweeps the
/// empty statements left behind.
struct ApplyVisitor {
    decoder_value_span: Span,
    payload_fn_span: Span,
    accessor: Option<Expr>
}

impl VisitMut for ApplyVisitor {
    fn visit_mut_key_value_prop(&mut self, prop: &mut KeyValueProp) {
        prop.visit_mut_children_with(self);

        if prop.value.span() == self.decoder_value_span {
            if let Some(accessor) = self.accessor.take() {
                prop.value = Box::new(accessor);
            }
        }
    }

    fn visit_mut_stmt(&mut self, stmt: &mut Stmt) {
        stmt.visit_mut_children_with(self);

        if let Stmt::Decl(Decl::Fn(fn_decl)) = stmt {
            if fn_decl.ident.span == self.payload_fn_span {
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
