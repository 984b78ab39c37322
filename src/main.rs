// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Gyre engine command line entry point.
//!
//! Offline tooling around engine descriptor files and runtime configuration.
//!
//! ## CLI Subcommands
//!
//! - `gyre-engine-cli check FILE` - Parse descriptors, validate references
//! - `gyre-engine-cli plan FILE` - Show weight source order per entry
//! - `gyre-engine-cli save FILE PATTERN... [--models]` - Write weights as safetensors
//! - `gyre-engine-cli batchmax PIXELS` - Advised max batch for a resolution
//! - `gyre-engine-cli config show|defaults|validate`

use std::path::Path;
use std::process::ExitCode;

use gyre_engine::cli::{self, config_cmd};
use gyre_engine::telemetry::{init_logging, init_metrics, LogConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging disabled: {}", e);
    }
    init_metrics();

    match command {
        "check" | "plan" => {
            let Some(path) = args.get(2) else {
                eprintln!("Missing descriptor file");
                print_command_help(command);
                return ExitCode::from(2u8);
            };
            let code = if command == "check" {
                cli::run_check(Path::new(path))
            } else {
                cli::run_plan(Path::new(path))
            };
            ExitCode::from(code as u8)
        }
        "save" => {
            let Some(path) = args.get(2) else {
                eprintln!("Missing descriptor file");
                print_command_help("save");
                return ExitCode::from(2u8);
            };
            let models = args[3..].iter().any(|a| a == "--models");
            let patterns: Vec<String> = args[3..]
                .iter()
                .filter(|a| !a.starts_with("--"))
                .cloned()
                .collect();
            if patterns.is_empty() {
                eprintln!("Missing engine or model pattern");
                print_command_help("save");
                return ExitCode::from(2u8);
            }
            ExitCode::from(cli::run_save(Path::new(path), &patterns, models) as u8)
        }
        "batchmax" => {
            let Some(pixels) = args.get(2) else {
                eprintln!("Missing pixel count");
                print_command_help("batchmax");
                return ExitCode::from(2u8);
            };
            ExitCode::from(cli::run_batchmax(pixels) as u8)
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    let json = args.get(3).map(|s| s.as_str()) == Some("--json");
                    ExitCode::from(config_cmd::run_show(json) as u8)
                }
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => ExitCode::from(config_cmd::run_validate() as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gyre-engine {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gyre-engine - GPU pipeline lifecycle manager v{}

USAGE:
    gyre-engine-cli [COMMAND] [OPTIONS]

COMMANDS:
    check FILE       Parse an engine descriptor file and validate references
    plan FILE        Show where weights would be looked for, per entry
    save FILE PAT..  Write engine weights to their local folders as safetensors
    batchmax PIXELS  Advised max batch for a pixel count or WIDTHxHEIGHT
    config           Inspect configuration (show, defaults, validate)
    version          Show version information
    help             Show this help message

ENVIRONMENT:
    GYRE_WEIGHT_ROOT         Local weight folder root (default: ./weights)
    GYRE_DEVICES             Comma separated devices (default: cpu)
    GYRE_VRAM_OPTIMISATION   Memory saving level 0-5 (default: 2)
    GYRE_LOG                 Log filter (default: info)
    GYRE_LOG_FORMAT          pretty or json

EXIT CODES:
    0  Success
    1  Failure / warnings found
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "check" => eprintln!(
            "gyre-engine-cli check - Validate a descriptor file

USAGE:
    gyre-engine-cli check FILE

DESCRIPTION:
    Loads engine and model records from a .toml ([[engines]]) or .json
    file, prints them, and checks that every @reference names an enabled
    model and that no references form a cycle.
"
        ),
        "plan" => eprintln!(
            "gyre-engine-cli plan - Show weight resolution order

USAGE:
    gyre-engine-cli plan FILE

DESCRIPTION:
    For each enabled entry, lists the sources that would be tried for its
    weights, honouring GYRE_REFRESH_MODELS and GYRE_REFRESH_ON_ERROR.
    Nothing is downloaded.
"
        ),
        "save" => eprintln!(
            "gyre-engine-cli save - Save weights as safetensors

USAGE:
    gyre-engine-cli save FILE PATTERN... [--models]

DESCRIPTION:
    Loads the weights behind every engine whose id matches a PATTERN,
    following @references and overrides, and writes each source once to
    its local_model folder (local_model_fp16 in fp16 mode). Pipelines get
    one sub-folder per component and a copy of model_index.json.
    With --models, PATTERN matches model_id instead and references are
    not followed. Only weights already on disk are read.
"
        ),
        "batchmax" => eprintln!(
            "gyre-engine-cli batchmax - Advised maximum batch size

USAGE:
    gyre-engine-cli batchmax PIXELS
    gyre-engine-cli batchmax WIDTHxHEIGHT

DESCRIPTION:
    Uses GYRE_BATCH_POINTS, or GYRE_BATCH_MAX when no points are set.
"
        ),
        "config" => eprintln!(
            "gyre-engine-cli config - Inspect configuration

USAGE:
    gyre-engine-cli config show [--json]
    gyre-engine-cli config defaults
    gyre-engine-cli config validate
"
        ),
        _ => {
            eprintln!("No help for '{}'", command);
            print_usage();
        }
    }
}
