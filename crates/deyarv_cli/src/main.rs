use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DecompileCommand, TopLevel};

mod cli;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path } => {
                let text = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        eprintln!("failed to read {path:?}: {e}");
                        std::process::exit(1);
                    }
                };
                let json: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(json) => json,
                    Err(e) => {
                        eprintln!("failed to parse {path:?} as JSON: {e}");
                        std::process::exit(1);
                    }
                };
                let raw = deyarv_lib::Raw::from_json(&json);
                match deyarv_lib::decompile(&raw) {
                    Ok(out) => {
                        println!("{out}");
                    }
                    Err(e) => {
                        eprintln!("decompile error: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help().unwrap();
        }
    }
}
