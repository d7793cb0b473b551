//! Command-line driver for the sylva HTN planner.
//!
//! Takes either a domain/problem pair (parsed and grounded through the
//! external tools) or an already-grounded problem file, runs the planner,
//! and prints the plan. Exits 0 when a plan is found, 1 otherwise.

mod external;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use sylva_instance::{GroundedInstance, LoadConfig};
use sylva_planner::{PlanOutcome, Planner, PlannerOptions};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sylva", version)]
#[command(about = "HTN planning via incremental SAT over a plan decomposition tree", long_about = None)]
struct Cli {
    /// HDDL domain file (parsed and grounded externally)
    #[arg(value_name = "DOMAIN", required_unless_present = "grounded")]
    domain: Option<PathBuf>,

    /// HDDL problem file
    #[arg(value_name = "PROBLEM", required_unless_present = "grounded")]
    problem: Option<PathBuf>,

    /// Load this grounded problem file directly, skipping parse/ground
    #[arg(long, value_name = "FILE")]
    grounded: Option<PathBuf>,

    /// External parser binary (also converts and verifies plans)
    #[arg(long, value_name = "PATH", default_value = "pandaPIparser")]
    parser: PathBuf,

    /// External grounder binary
    #[arg(long, value_name = "PATH", default_value = "pandaPIgrounder")]
    grounder: PathBuf,

    /// Expand partially ordered with before/next ordering literals
    #[arg(long)]
    partial_order: bool,

    /// Use mutex groups: at-most-one clauses and inference refinement
    #[arg(long)]
    mutexes: bool,

    /// Infer method preconditions and effects
    #[arg(long)]
    effect_inference: bool,

    /// Fold synthetic method-precondition actions into method preconditions
    #[arg(long)]
    remove_method_prec_action: bool,

    /// Maximum decomposition depth
    #[arg(long, default_value = "50")]
    max_depth: usize,

    /// Verify a found plan with the external verifier
    #[arg(long)]
    verify: bool,

    /// SAT solver randomness seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Print a PVN line for every allocated SAT variable
    #[arg(long)]
    print_var_names: bool,

    /// Disable the leaf-overleaf relaxation ladder
    #[arg(long)]
    no_relaxation: bool,

    /// Mirror the emitted formula into this DIMACS file
    #[arg(long, value_name = "FILE")]
    write_formula: Option<PathBuf>,

    /// Write the final plan to this file
    #[arg(long, value_name = "FILE")]
    write_plan: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<bool> {
    // Resolve a grounded problem file, going through the external tools
    // unless one was handed to us directly.
    let mut _workdir = None;
    let grounded_path = match &cli.grounded {
        Some(path) => path.clone(),
        None => {
            let (domain, problem) = (
                cli.domain.as_ref().expect("clap enforces this"),
                cli.problem.as_ref().expect("clap enforces this"),
            );
            let (dir, path) = external::parse_and_ground(
                &cli.parser,
                &cli.grounder,
                domain,
                problem,
                cli.mutexes,
            )
            .context("parsing/grounding failed")?;
            _workdir = Some(dir);
            path
        }
    };

    let load_config = LoadConfig {
        partial_order: cli.partial_order,
        parse_mutexes: cli.mutexes,
        fold_method_preconditions: cli.remove_method_prec_action,
    };
    let instance = GroundedInstance::load(&grounded_path, &load_config)
        .context("loading the grounded problem failed")?;
    info!(
        predicates = instance.num_predicates(),
        actions = instance.num_actions(),
        tasks = instance.abstract_tasks.len(),
        methods = instance.num_methods(),
        "instance loaded"
    );

    let options = PlannerOptions {
        partial_order: cli.partial_order,
        use_mutexes: cli.mutexes,
        use_effect_inference: cli.effect_inference,
        remove_method_precondition_action: cli.remove_method_prec_action,
        max_depth: cli.max_depth,
        verify_plan: cli.verify,
        seed: cli.seed,
        print_variable_names: cli.print_var_names,
        allow_relaxation: !cli.no_relaxation,
        write_formula: cli.write_formula.clone(),
    };

    let mut planner = Planner::new(instance, options)?;
    let plan = match planner.find_plan()? {
        PlanOutcome::Found(plan) => plan,
        PlanOutcome::NoPlan => {
            warn!("no plan up to the depth bound");
            return Ok(false);
        }
        PlanOutcome::Cancelled => {
            warn!("planning cancelled");
            return Ok(false);
        }
    };
    info!(size = plan.size, "plan found");

    // With the external parser available, convert the raw plan to the
    // final format and optionally verify it.
    let have_tools = cli.grounded.is_none();
    let final_plan = if have_tools {
        external::convert_plan(&cli.parser, &plan.text).context("plan conversion failed")?
    } else {
        plan.text.clone()
    };

    if cli.verify {
        if !have_tools {
            bail!("--verify needs the external parser (domain/problem invocation)");
        }
        let domain = cli.domain.as_ref().expect("checked above");
        let problem = cli.problem.as_ref().expect("checked above");
        if !external::verify_plan(&cli.parser, domain, problem, &final_plan)? {
            bail!("plan verification failed");
        }
        info!("plan verified");
    }

    println!("{final_plan}");

    if let Some(path) = &cli.write_plan {
        std::fs::write(path, &final_plan)
            .with_context(|| format!("writing plan to {}", path.display()))?;
        info!(path = %path.display(), "plan written");
    }

    Ok(true)
}
