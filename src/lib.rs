use std::fmt::{Debug, Display, Formatter};
use std::io::Write;
use std::sync::Arc;
use swc::config::IsModule;
use swc_core::common::errors::{EmitterWriter, Handler};
use swc_core::common::{chain, FileName, Globals, GLOBALS, SourceMap};
use swc_core::ecma::ast::{EsVersion, Program};
use swc_core::ecma::codegen::text_writer::JsWriter;
use swc_core::ecma::codegen::Emitter;
use swc_core::ecma::visit::as_folder;
use swc_ecma_parser::{EsConfig, Syntax};

pub mod deobfuscate;
pub mod trace;

use trace::Trace;

/// A fatal string-table failure.
///
/// The string-array pass is the only pass whose failure aborts the
/// pipeline: every later pass assumes a decoded literal table exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// The large encoded payload string was not found.
    MissingLargeString,

    /// The keyed decoder was not found.
    MissingDecoder,

    /// A decoder was found but no shuffle operations could be extracted
    /// from it.
    NoShuffleOps,

    /// The payload exists but cannot be decoded (bad percent-encoding,
    /// invalid UTF-8, or the XOR produced an invalid code point).
    MalformedPayload(String)
}

impl Display for DecodeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingLargeString => write!(f, "large payload string not found"),
            Self::MissingDecoder => write!(f, "string-table decoder not found"),
            Self::NoShuffleOps => write!(f, "no shuffle operations extracted from decoder"),
            Self::MalformedPayload(reason) => write!(f, "malformed payload: {}", reason)
        }
    }
}

impl std::error::Error for DecodeFailure {}

/// A deobfuscation error.
#[derive(Debug)]
pub enum DeobfuscateError {
    /// SWC failed to parse the input script.
    ParseError(anyhow::Error),

    /// The string table could not be rebuilt.
    DecodeError(DecodeFailure),

    /// Code generation for the rewritten tree failed.
    EmitError(anyhow::Error)
}

impl Display for DeobfuscateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParseError(e) => write!(f, "ParseError: {}", e),
            Self::DecodeError(e) => write!(f, "DecodeError: {}", e),
            Self::EmitError(e) => write!(f, "EmitError: {}", e)
        }
    }
}

impl std::error::Error for DeobfuscateError {}

impl From<DecodeFailure> for DeobfuscateError {
    fn from(failure: DecodeFailure) -> Self {
        Self::DecodeError(failure)
    }
}

/// Reverses the bundle's obfuscation and returns the simplified source.
///
/// Four tree-rewriting passes run in a fixed order: the encoded string
/// table is decoded and replaced with a literal accessor, accessor calls
/// over literal arrays are folded to the values they select, dispatch
/// aliases are resolved back to canonical globals, and proxy-wrapper
/// calls are replaced with direct calls. Only the first pass can fail;
/// the others degrade to no-ops when their pattern is absent. On failure
/// no output is produced.
pub fn deobfuscate(source: &str) -> Result<String, DeobfuscateError> {
    deobfuscate_traced(source, &Trace::new())
}

/// Like [deobfuscate], but appends per-pass discovery and rewrite lines
/// to the given [Trace]. The trace is informational only.
pub fn deobfuscate_traced(source: &str, trace: &Trace) -> Result<String, DeobfuscateError> {
    let cm = Arc::<SourceMap>::default();
    let handler = Handler::with_emitter(
        false,
        false,
        Box::new(EmitterWriter::new(
            Box::new(trace.clone()) as Box<dyn Write + Send>,
            None,
            true,
            false
        ))
    );
    let compiler = swc::Compiler::new(cm.clone());
    let fm = cm.new_source_file(FileName::Custom("obfuscated.js".into()), source.to_string());

    let globals = Globals::new();
    GLOBALS.set(&globals, || {
        let program = match compiler.parse_js(
            fm,
            &handler,
            EsVersion::latest(),
            Syntax::Es(EsConfig::default()),
            IsModule::Bool(false),
            None
        ) {
            Ok(v) => v,
            Err(e) => return Err(DeobfuscateError::ParseError(e))
        };

        // Rebuild the string table first. Its outcome decides whether
        // the rest of the pipeline runs at all.
        let mut string_table = deobfuscate::string_array::Visitor::new(trace.clone());
        let program = compiler.transform(&handler, program, true, as_folder(&mut string_table));
        if let Some(failure) = string_table.failure.take() {
            return Err(DeobfuscateError::from(failure));
        }

        let program = compiler.transform(&handler, program, true, chain!(
            // Fold accessor calls over literal arrays
            as_folder(deobfuscate::static_array::Visitor::new(trace.clone())),
            // Resolve dispatch aliases to canonical globals
            as_folder(deobfuscate::mappings::Visitor::new(trace.clone())),
            // Replace proxy-wrapper calls with direct calls
            as_folder(deobfuscate::proxy_calls::Visitor::new(trace.clone()))
        ));

        emit_program(&cm, &program).map_err(DeobfuscateError::EmitError)
    })
}

/// Regenerates source text for a program.
fn emit_program(cm: &Arc<SourceMap>, program: &Program) -> Result<String, anyhow::Error> {
    let mut buf = Vec::new();
    {
        let mut emitter = Emitter {
            cfg: Default::default(),
            cm: cm.clone(),
            comments: None,
            wr: JsWriter::new(cm.clone(), "\n", &mut buf, None)
        };
        emitter.emit_program(program)?;
    }
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use swc::config::IsModule;
    use swc_core::common::errors::{ColorConfig, Handler};
    use swc_core::common::{FileName, Globals, GLOBALS, SourceMap};
    use swc_core::ecma::ast::{EsVersion, Expr, Program, Stmt};
    use swc_ecma_parser::{EsConfig, Syntax};

    /// Runs `f` with fresh SWC globals, the way the pipeline driver does.
    pub fn with_globals<R>(f: impl FnOnce() -> R) -> R {
        let globals = Globals::new();
        GLOBALS.set(&globals, f)
    }

    pub fn parse_program(source: &str) -> (Arc<SourceMap>, Program) {
        let cm = Arc::<SourceMap>::default();
        let handler = Handler::with_tty_emitter(ColorConfig::Never, true, false, Some(cm.clone()));
        let compiler = swc::Compiler::new(cm.clone());
        let fm = cm.new_source_file(FileName::Custom("test.js".into()), source.to_string());
        let program = compiler
            .parse_js(
                fm,
                &handler,
                EsVersion::latest(),
                Syntax::Es(EsConfig::default()),
                IsModule::Bool(false),
                None
            )
            .expect("test source should parse");
        (cm, program)
    }

    /// Parses a single expression statement and returns its expression.
    pub fn parse_expr(source: &str) -> Expr {
        let (_, program) = parse_program(&format!("{};", source));
        match program {
            Program::Script(script) => match script.body.into_iter().next() {
                Some(Stmt::Expr(expr_stmt)) => *expr_stmt.expr,
                _ => panic!("expected an expression statement")
            },
            _ => panic!("expected a script")
        }
    }

    pub fn emit(cm: &Arc<SourceMap>, program: &Program) -> String {
        super::emit_program(cm, program).expect("codegen should succeed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forward-encodes a joined plaintext: XOR with the key, then
    /// percent-encode every byte.
    fn encode_payload(joined: &str, key: &str) -> String {
        let key_chars: Vec<char> = key.chars().collect();
        let mut out = String::new();
        for (i, c) in joined.chars().enumerate() {
            let k = key_chars[i % key_chars.len()];
            let xored = char::from_u32((c as u32) ^ (k as u32)).unwrap();
            let mut buf = [0u8; 4];
            for byte in xored.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        }
        out
    }

    /// An obfuscated script exercising all four passes. The string table
    /// decodes to `["gamma", "alpha", "beta"]`: the single shuffle op
    /// pulls the first three ciphertext entries out, keeps only their
    /// head and moves it to the front, discarding the two padding
    /// entries.
    fn full_fixture() -> String {
        let padding = "p".repeat(600);
        let cipher_order = ["gamma", "pad", padding.as_str(), "alpha", "beta"];
        let encoded = encode_payload(&cipher_order.join("|"), "K3y");
        format!(
            concat!(
                "function blob() {{ return \"{}\"; }}\n",
                "table = (function () {{\n",
                "    return {{\n",
                "        get: (function (key) {{\n",
                "            var raw = blob();\n",
                "            var parts;\n",
                "            var out = \"\";\n",
                "            for (var i = 0; i < raw.length; i++) {{\n",
                "                out += String.fromCharCode(raw.charCodeAt(i) ^ key.charCodeAt(i % key.length));\n",
                "            }}\n",
                "            parts = cut(out, \"|\");\n",
                "            reorder(parts.splice(0, 3), 0, 1);\n",
                "            return parts;\n",
                "        }})(\"K3y\")\n",
                "    }};\n",
                "}})();\n",
                "M6J(k2K, \"fromCharCode\", 0, \"fc\");\n",
                "P.go = function () {{ return typeof util.go === \"function\" ? util.go.apply(util, arguments) : util.go; }};\n",
                "log(table.get(1));\n",
                "log(i.fc(65));\n",
                "P.go(table.get(0));\n"
            ),
            encoded
        )
    }

    #[test]
    fn pipeline_applies_all_four_passes() {
        let trace = Trace::new();
        let output = deobfuscate_traced(&full_fixture(), &trace)
            .expect("deobfuscation failed");

        // String table decoded and accessor calls folded
        assert!(output.contains("log(\"alpha\")"), "output:\n{}", output);
        // Alias mapping resolved
        assert!(output.contains("String.fromCharCode(65)"), "output:\n{}", output);
        // Proxy call inlined, with the folded argument
        assert!(output.contains("util.go(\"gamma\")"), "output:\n{}", output);
        // Obfuscation scaffolding is gone
        assert!(!output.contains("function blob"));
        assert!(!output.contains("apply"));
        assert!(!trace.lines().is_empty());
    }

    #[test]
    fn pipeline_is_deterministic() {
        let source = full_fixture();
        let first = deobfuscate(&source).expect("first run failed");
        let second = deobfuscate(&source).expect("second run failed");
        assert_eq!(first, second);
    }

    #[test]
    fn missing_table_aborts_with_no_output() {
        let err = deobfuscate("var x = 1;").unwrap_err();
        match err {
            DeobfuscateError::DecodeError(DecodeFailure::MissingLargeString) => {}
            other => panic!("unexpected error: {}", other)
        }
    }

    #[test]
    fn parse_errors_are_reported() {
        let err = deobfuscate("function {").unwrap_err();
        assert!(matches!(err, DeobfuscateError::ParseError(..)));
    }
}
