//! shipline - run declarative delivery pipelines
//!
//! ## Commands
//!
//! - `shipline run` - Execute a pipeline definition
//! - `shipline plan` - Show which stages the environment makes eligible
//! - `shipline check` - Validate pipeline definitions
//! - `shipline template` - Print the reference delivery pipeline
//! - `shipline completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Start from the reference pipeline
//! shipline template --project shop -o pipeline.yaml
//!
//! # See what would run with the current environment
//! shipline plan pipeline.yaml -e STAGING_URL=http://localhost:8080
//!
//! # Run it
//! shipline run pipeline.yaml --fail-on-unstable
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if std::env::var("SHIPLINE_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
