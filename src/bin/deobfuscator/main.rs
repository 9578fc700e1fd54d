use std::env;
use std::fs;
use std::process::exit;
use bundle_deobfuscator::deobfuscate_traced;
use bundle_deobfuscator::trace::Trace;

// Deobfuscates the script at the given path and prints the result to
// stdout. Trace lines go to stderr.
fn main() {
    let args: Vec<String> = env::args().collect();
    let path = match args.get(1) {
        Some(v) => v,
        None => {
            println!("You must pass in the path to the obfuscated script.");
            return;
        }
    };
    let source = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to read {}: {}", path, e);
            exit(1);
        }
    };

    let trace = Trace::new();
    let result = deobfuscate_traced(&source, &trace);
    for line in trace.lines() {
        eprintln!("{}", line);
    }
    match result {
        Ok(code) => println!("{}", code),
        Err(e) => {
            eprintln!("deobfuscation failed: {}", e);
            exit(1);
        }
    }
}
