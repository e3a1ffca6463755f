//! Stackweave CLI
//!
//! Usage:
//!   stackweave [OPTIONS] <COMMAND>
//!
//! Commands:
//!   compile  Compile a template to CloudFormation JSON
//!   depends  Print a Makefile dependency line for a template
//!   tags     Print the resolved stack tags of a template
//!
//! Options:
//!   -v, --verbose  Log template loading to stderr
//!   -h, --help     Print help

use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{Parser, Subcommand};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use stackweave::{CompileConfig, ParameterValues, TemplateCompiler, TemplateError, TemplateReader};

#[derive(Parser)]
#[command(name = "stackweave")]
#[command(about = "Compile Stackweave templates into CloudFormation templates")]
struct Cli {
    /// Log template loading and compile passes to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a template to CloudFormation JSON
    Compile {
        /// The template file to compile
        file: PathBuf,

        /// The file to write the template to (prints to stdout if not provided)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Compile for building AMIs
        #[arg(long)]
        for_amis: bool,
    },

    /// Print a Makefile dependency line for a template
    Depends {
        /// The template file to process
        file: PathBuf,

        /// The file that would be generated from the template
        target: String,
    },

    /// Print the resolved stack tags of a template
    Tags {
        /// The template file to process
        file: PathBuf,

        /// Parameter values for tags referencing parameters (TOML format)
        #[arg(short, long)]
        params: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Compile {
            file,
            out,
            for_amis,
        } => {
            let config = CompileConfig::new().with_for_amis(for_amis);
            let compiled = or_exit(TemplateCompiler::new(config).compile_file(&file));
            let json = or_exit(compiled.to_json());

            match out {
                Some(path) => {
                    if let Err(e) = write_output(&path, &json) {
                        eprintln!("Unable to write to \"{}\": {}", path.display(), e);
                        exit(1);
                    }
                }
                None => println!("{}", json),
            }
        }
        Command::Depends { file, target } => {
            let mut reader = TemplateReader::new();
            or_exit(reader.load_file(&file));
            println!("{}", reader.dependency_line(&target, &file));
        }
        Command::Tags { file, params } => {
            let params = match &params {
                Some(path) => match ParameterValues::from_file(path) {
                    Ok(p) => p,
                    Err(e) => {
                        eprintln!("Error loading parameters '{}': {}", path.display(), e);
                        exit(1);
                    }
                },
                None => ParameterValues::default(),
            };

            let compiled = or_exit(TemplateCompiler::default().compile_file(&file));
            for (name, value) in or_exit(compiled.resolve_tags(&params)) {
                println!("{}={}", name, value);
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter),
        )
        .init();
}

fn write_output(path: &Path, json: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, json)
}

fn or_exit<T>(result: Result<T, TemplateError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            report(&e);
            exit(1);
        }
    }
}

fn report(err: &TemplateError) {
    match err {
        TemplateError::Syntax {
            filename: Some(filename),
            location: Some(_),
            ..
        } => {
            let rendered = fs::read_to_string(filename)
                .map(|source| err.format(&source, &filename.display().to_string()))
                .unwrap_or_else(|_| err.to_string());
            eprintln!("Template syntax error:\n{}", rendered);
        }
        TemplateError::Syntax { .. } => eprintln!("Template syntax error: {}", err),
        _ => eprintln!("Template error: {}", err),
    }
}
