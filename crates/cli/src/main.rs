mod logging;
mod serve;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use larkline_grammar::Algorithm;
use larkline_live::{AstNode, LiveConfig, ParseResult, ParseSettings, ParserCache, ValidationResult};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Parsing algorithm as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ParserArg {
    Earley,
    Lalr,
}

impl From<ParserArg> for Algorithm {
    fn from(arg: ParserArg) -> Self {
        match arg {
            ParserArg::Earley => Algorithm::Earley,
            ParserArg::Lalr => Algorithm::Lalr,
        }
    }
}

/// Live grammar playground: parse server and grammar tools.
#[derive(Parser)]
#[command(name = "larkline", version, about = "Live grammar playground: parse server and grammar tools")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log filter, e.g. `info` or `larkline_live=debug` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct GrammarArgs {
    /// Parsing algorithm
    #[arg(long, value_enum, default_value = "earley")]
    parser: ParserArg,
    /// Rule to start parsing from
    #[arg(long, default_value = "start")]
    start: String,
    /// Collect grammar construction warnings
    #[arg(long)]
    debug: bool,
}

impl GrammarArgs {
    fn settings(&self) -> ParseSettings {
        ParseSettings {
            parser: self.parser.into(),
            start_rule: self.start.clone(),
            debug: self.debug,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Address to bind (default: LARKLINE_HOST or 127.0.0.1)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (default: LARKLINE_PORT or 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Parse a text file with a grammar file
    Parse {
        /// Path to the .lark grammar
        grammar: PathBuf,
        /// Path to the text to parse
        text: PathBuf,
        #[command(flatten)]
        args: GrammarArgs,
    },

    /// Check that a grammar compiles
    Validate {
        /// Path to the .lark grammar
        grammar: PathBuf,
        #[command(flatten)]
        args: GrammarArgs,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), cli.quiet);

    let mut config = LiveConfig::from_env();

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let rt = runtime(cli.output, cli.quiet);
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                report_error(&format!("server error: {}", e), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::Parse { grammar, text, args } => {
            cmd_parse(&config, &grammar, &text, &args.settings(), cli.output, cli.quiet);
        }
        Commands::Validate { grammar, args } => {
            cmd_validate(&config, &grammar, &args.settings(), cli.output, cli.quiet);
        }
    }
}

fn runtime(output: OutputFormat, quiet: bool) -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to start async runtime: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

fn read_source(path: &Path, what: &str, output: OutputFormat, quiet: bool) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading {} '{}': {}", what, path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

fn check_settings(settings: &ParseSettings, output: OutputFormat, quiet: bool) {
    if let Err(e) = settings.validate() {
        report_error(&e.to_string(), output, quiet);
        process::exit(1);
    }
}

// ──────────────────────────────────────────────
// parse
// ──────────────────────────────────────────────

fn cmd_parse(
    config: &LiveConfig,
    grammar_path: &Path,
    text_path: &Path,
    settings: &ParseSettings,
    output: OutputFormat,
    quiet: bool,
) {
    check_settings(settings, output, quiet);
    let grammar = read_source(grammar_path, "grammar", output, quiet);
    let text = read_source(text_path, "text", output, quiet);

    let rt = runtime(output, quiet);
    let cache = ParserCache::new(config);
    let result: Arc<ParseResult> = match rt.block_on(cache.parse_with_cache(&grammar, &text, settings, false)) {
        Ok(result) => result,
        Err(e) => {
            report_error(&format!("parse failed: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&*result)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization error: {}\"}}", e));
            println!("{}", json);
        }
        OutputFormat::Text => match (result.tree(), result.error()) {
            (Some(tree), _) => {
                if !quiet {
                    print!("{}", pretty(tree));
                }
            }
            (None, Some(error)) => {
                if !quiet {
                    eprintln!("{}: {}", result.status().as_str(), error.message);
                    if let Some(context) = &error.context {
                        eprint!("{}", context);
                    }
                    for suggestion in error.suggestions.iter().flatten() {
                        eprintln!("  hint: {}", suggestion);
                    }
                }
            }
            (None, None) => {}
        },
    }

    if !result.is_success() {
        process::exit(1);
    }
}

/// Indented rendering of a parse tree, one node per line.
fn pretty(node: &AstNode) -> String {
    let mut out = String::new();
    write_node(node, 0, &mut out);
    out
}

fn write_node(node: &AstNode, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    match node {
        AstNode::Tree { data, children } => {
            out.push_str(&format!("{}{}\n", indent, data));
            for child in children {
                write_node(child, depth + 1, out);
            }
        }
        AstNode::Token { data, terminal, .. } => {
            out.push_str(&format!("{}{} {:?}\n", indent, terminal, data));
        }
    }
}

// ──────────────────────────────────────────────
// validate
// ──────────────────────────────────────────────

fn cmd_validate(config: &LiveConfig, grammar_path: &Path, settings: &ParseSettings, output: OutputFormat, quiet: bool) {
    check_settings(settings, output, quiet);
    let grammar = read_source(grammar_path, "grammar", output, quiet);

    let rt = runtime(output, quiet);
    let cache = ParserCache::new(config);
    let result: ValidationResult = match rt.block_on(cache.validate_grammar(&grammar, settings)) {
        Ok(result) => result,
        Err(e) => {
            report_error(&format!("validation failed: {}", e), output, quiet);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&result)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization error: {}\"}}", e));
            if result.is_valid {
                println!("{}", json);
            } else {
                eprintln!("{}", json);
            }
        }
        OutputFormat::Text => {
            if result.is_valid {
                if !quiet {
                    println!(
                        "valid ({} rules, {} terminals)",
                        result.rule_count, result.terminal_count
                    );
                    for warning in &result.warnings {
                        println!("  warning: {}", warning);
                    }
                }
            } else if !quiet {
                eprintln!("invalid grammar");
                for error in &result.errors {
                    match (error.line, error.column) {
                        (Some(line), Some(column)) => {
                            eprintln!("  - {} (line {}, column {})", error.message, line, column)
                        }
                        _ => eprintln!("  - {}", error.message),
                    }
                }
            }
        }
    }

    if !result.is_valid {
        process::exit(1);
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Text => {
            if !quiet {
                eprintln!("{}", msg)
            }
        }
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_prints_nested_tree() {
        let tree = AstNode::Tree {
            data: "start".into(),
            children: vec![
                AstNode::Tree {
                    data: "pair".into(),
                    children: vec![AstNode::Token {
                        data: "a".into(),
                        terminal: "WORD".into(),
                        start_pos: Some(0),
                        end_pos: Some(1),
                        line: Some(1),
                        column: Some(1),
                    }],
                },
            ],
        };
        assert_eq!(pretty(&tree), "start\n  pair\n    WORD \"a\"\n");
    }

    #[test]
    fn parser_arg_maps_to_algorithm() {
        assert_eq!(Algorithm::from(ParserArg::Lalr), Algorithm::Lalr);
        assert_eq!(Algorithm::from(ParserArg::Earley), Algorithm::Earley);
    }
}
