//! Synchronous invocation of the external parser, grounder, plan converter
//! and verifier. All data passes through temporary files that are removed
//! on every exit path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tracing::{debug, info};

/// A child tool failed or could not be run.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
    },

    #[error("temporary file error: {0}")]
    TempFile(#[from] std::io::Error),
}

fn run_tool(program: &Path, args: &[&str]) -> Result<(), ExternalToolError> {
    debug!(tool = %program.display(), ?args, "running external tool");
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| ExternalToolError::Spawn {
            tool: program.display().to_string(),
            source,
        })?;
    if !status.success() {
        return Err(ExternalToolError::Failed {
            tool: program.display().to_string(),
            status,
        });
    }
    Ok(())
}

/// Parse and ground a domain/problem pair; returns the grounded file path
/// together with the directory guard keeping it alive.
pub fn parse_and_ground(
    parser: &Path,
    grounder: &Path,
    domain: &Path,
    problem: &Path,
    with_mutexes: bool,
) -> Result<(TempDir, PathBuf), ExternalToolError> {
    let workdir = TempDir::new()?;
    let parsed = workdir.path().join("problem.parsed");
    let grounded = workdir.path().join("problem.grounded");

    info!(domain = %domain.display(), problem = %problem.display(), "parsing");
    run_tool(
        parser,
        &[
            &domain.display().to_string(),
            &problem.display().to_string(),
            &parsed.display().to_string(),
        ],
    )?;

    info!("grounding");
    let grounded_str = grounded.display().to_string();
    let parsed_str = parsed.display().to_string();
    let mut args: Vec<&str> = Vec::new();
    if with_mutexes {
        args.push("--invariants");
    }
    args.push(&parsed_str);
    args.push(&grounded_str);
    run_tool(grounder, &args)?;

    Ok((workdir, grounded))
}

/// Convert raw plan text to the final plan format.
pub fn convert_plan(parser: &Path, raw_plan: &str) -> Result<String, ExternalToolError> {
    let mut raw_file = NamedTempFile::new()?;
    raw_file.write_all(raw_plan.as_bytes())?;
    raw_file.flush()?;
    let final_file = NamedTempFile::new()?;

    run_tool(
        parser,
        &[
            "--panda-converter",
            &raw_file.path().display().to_string(),
            &final_file.path().display().to_string(),
        ],
    )?;

    let mut converted = std::fs::read_to_string(final_file.path())?;
    if !converted.ends_with("<==\n") {
        converted.push_str("<==\n");
    }
    Ok(converted)
}

/// Run the external verifier over a final plan. `Ok(false)` means the
/// verifier rejected the plan.
pub fn verify_plan(
    parser: &Path,
    domain: &Path,
    problem: &Path,
    plan: &str,
) -> Result<bool, ExternalToolError> {
    let mut plan_file = NamedTempFile::new()?;
    plan_file.write_all(plan.as_bytes())?;
    plan_file.flush()?;

    let result = run_tool(
        parser,
        &[
            "--verify",
            &domain.display().to_string(),
            &problem.display().to_string(),
            &plan_file.path().display().to_string(),
        ],
    );
    match result {
        Ok(()) => Ok(true),
        Err(ExternalToolError::Failed { .. }) => Ok(false),
        Err(other) => Err(other),
    }
}
