use anyhow::Result;
use clap::{Parser, Subcommand};
use phaser::analytics::ExecutionStatus;
use phaser::cmd::{self, CmdContext, OutputFormat};
use phaser::contracts::{RuleType, Severity};
use phaser::enforce::SeverityFilter;
use phaser::negotiate::ModifyField;
use phaser::reverse::GroupStrategy;
use phaser::sandbox::MergeStrategy;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "phaser")]
#[command(version, about = "Audit-automation toolchain: phased, replayable code changes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and sanity-check an audit document
    Validate {
        file: PathBuf,
        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    /// Split an audit into phase files and prepare the workspace
    Prepare {
        file: PathBuf,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Prepare an audit and drive its phases
    Execute {
        file: PathBuf,
        /// Record that the agent should run without permission prompts
        #[arg(long)]
        no_permissions: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        fail_fast: bool,
    },
    /// Sandbox control
    Simulate {
        #[command(subcommand)]
        command: SimulateCommands,
    },
    /// Branch-mode control
    Branches {
        #[command(subcommand)]
        command: BranchCommands,
    },
    /// Manifest operations
    Diff {
        #[command(subcommand)]
        command: DiffCommands,
    },
    /// Contract management
    Contracts {
        #[command(subcommand)]
        command: ContractCommands,
    },
    /// CI gate: run all contracts over the working tree
    Check {
        /// Fail on warnings too, not only errors
        #[arg(long)]
        fail_on_error: bool,
        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },
    /// Enforcement hook entry point
    Enforce {
        /// Read one hook payload from stdin
        #[arg(long)]
        stdin: bool,
        #[arg(long, value_enum, default_value = "all")]
        severity: SeverityFilter,
        #[command(subcommand)]
        command: Option<EnforceCommands>,
    },
    /// Negotiation editor over a parsed audit
    Negotiate {
        #[command(subcommand)]
        command: NegotiateCommands,
    },
    /// Infer an audit-shaped document from a commit range
    Reverse {
        range: String,
        #[arg(value_enum, default_value = "preview")]
        mode: cmd::reverse::ReverseMode,
        #[arg(long, value_enum, default_value = "semantic")]
        strategy: GroupStrategy,
        #[arg(long, value_enum, default_value = "markdown")]
        format: cmd::reverse::ReverseFormat,
        #[arg(long, default_value_t = phaser::reverse::DEFAULT_MAX_PHASES)]
        max_phases: usize,
    },
    /// Execution-report analytics
    Analytics {
        #[command(subcommand)]
        command: AnalyticsCommands,
    },
    /// Regression-check a completed audit against the current tree
    Replay {
        slug: String,
        #[arg(long, value_enum, default_value = "all")]
        scope: cmd::replay::ReplayScope,
        #[arg(long)]
        fail_on_regression: bool,
    },
    /// View or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Stored audit records
    Audits {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// The durable event log
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },
}

#[derive(Subcommand)]
pub enum SimulateCommands {
    /// Run the pending audit in a sandbox
    Run {
        /// Restrict to a phase range, e.g. `2` or `1-3`
        #[arg(long)]
        phases: Option<String>,
        #[arg(long)]
        commit_on_success: bool,
    },
    Rollback,
    Commit,
    Status,
}

#[derive(Subcommand)]
pub enum BranchCommands {
    Enable {
        /// Base branch (defaults to the current branch)
        #[arg(long)]
        base: Option<String>,
    },
    Status,
    Merge {
        #[arg(long, value_enum, default_value = "squash")]
        strategy: MergeStrategy,
        #[arg(long)]
        target: Option<String>,
    },
    Cleanup {
        /// Force-delete unmerged branches too
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
pub enum DiffCommands {
    /// Capture a manifest of a directory tree
    Capture {
        root: PathBuf,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Compare two captured manifests
    Compare {
        before: PathBuf,
        after: PathBuf,
        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
pub enum ContractCommands {
    Create {
        #[arg(long)]
        id: String,
        #[arg(long = "type", value_enum)]
        rule_type: RuleType,
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        glob: String,
        #[arg(long)]
        message: String,
        #[arg(long, value_enum, default_value = "error")]
        severity: Severity,
        #[arg(long)]
        rationale: Option<String>,
        /// Write to the user scope instead of the project scope
        #[arg(long)]
        user: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run all contracts over the working tree
    Check {
        #[arg(long)]
        fail_on_error: bool,
        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },
    Enable { id: String },
    Disable { id: String },
    Show { id: String },
}

#[derive(Subcommand)]
pub enum EnforceCommands {
    /// Install the hook configuration into Claude settings
    Install {
        #[arg(long, value_enum, default_value = "project")]
        scope: cmd::enforce::InstallScope,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum NegotiateCommands {
    /// Open (or resume) a session, optionally applying an ops file
    Open {
        file: PathBuf,
        /// YAML file of operations to apply
        #[arg(long)]
        ops: Option<PathBuf>,
    },
    /// Show the current phase list
    Preview { file: PathBuf },
    Skip { file: PathBuf, phase_id: String },
    Unskip { file: PathBuf, phase_id: String },
    /// Apply an ops file to the session
    Apply {
        file: PathBuf,
        #[arg(long)]
        ops: PathBuf,
    },
    Modify {
        file: PathBuf,
        phase_id: String,
        #[arg(long, value_enum)]
        field: ModifyField,
        #[arg(long)]
        value: String,
    },
    Reset {
        file: PathBuf,
        /// `all` or a phase id
        #[arg(default_value = "all")]
        scope: String,
    },
    Export {
        file: PathBuf,
        #[arg(long)]
        include_skipped: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Status { file: PathBuf },
}

#[derive(Subcommand)]
pub enum AnalyticsCommands {
    Show {
        #[arg(long)]
        last: Option<usize>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, value_enum)]
        status: Option<ExecutionStatus>,
        #[arg(long)]
        document: Option<String>,
        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },
    Import { report: PathBuf },
    Export {
        #[arg(long)]
        last: Option<usize>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, value_enum)]
        status: Option<ExecutionStatus>,
        #[arg(long)]
        document: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Clear,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    Show {
        #[arg(long)]
        json: bool,
    },
    Set { key: String, value: String },
    Reset,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Show {
        slug: String,
        #[arg(long)]
        json: bool,
    },
    Abandon { slug: String },
}

#[derive(Subcommand)]
pub enum EventCommands {
    List {
        #[arg(long)]
        audit: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Prune old events per retention settings
    Clear {
        /// Also drop everything before this date or timestamp
        #[arg(long)]
        before: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if std::env::var_os("NO_COLOR").is_some() {
        console::set_colors_enabled(false);
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let code = phaser::errors::exit_code(&err);
            if cli.verbose {
                eprintln!("error: {:?}", err);
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(code);
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    // The enforce hook must not pay for store resolution of unrelated
    // commands; it builds its own context from the payload's cwd.
    if let Commands::Enforce {
        stdin: true,
        severity,
        command: None,
    } = &cli.command
    {
        let output = cmd::enforce::run_stdin(*severity)?;
        print!("{}", output);
        std::io::stdout().flush().ok();
        return Ok(0);
    }

    let ctx = CmdContext::new(cli.project_dir.clone())?;
    match &cli.command {
        Commands::Validate { file, strict, json } => {
            let report = cmd::validate::run(file, *strict, *json)?;
            Ok(if report.valid { 0 } else { 1 })
        }
        Commands::Prepare {
            file,
            project,
            force,
        } => {
            cmd::prepare::prepare(&ctx, file, project.as_deref(), *force)?;
            Ok(0)
        }
        Commands::Execute {
            file,
            no_permissions,
            force,
            fail_fast,
        } => {
            let args = cmd::prepare::ExecuteArgs {
                no_permissions: *no_permissions,
                force: *force,
                fail_fast: *fail_fast,
                simulate: false,
                branch: false,
            };
            let summary = cmd::prepare::execute(&ctx, file, &args).await?;
            Ok(if summary.phases_failed > 0 { 1 } else { 0 })
        }
        Commands::Simulate { command } => match command {
            SimulateCommands::Run {
                phases,
                commit_on_success,
            } => {
                let args = cmd::simulate::SimulateRunArgs {
                    phases: phases.clone(),
                    commit_on_success: *commit_on_success,
                };
                let summary = cmd::simulate::run(&ctx, &args).await?;
                Ok(if summary.phases_failed > 0 { 1 } else { 0 })
            }
            SimulateCommands::Rollback => {
                cmd::simulate::rollback(&ctx)?;
                Ok(0)
            }
            SimulateCommands::Commit => {
                cmd::simulate::commit(&ctx)?;
                Ok(0)
            }
            SimulateCommands::Status => {
                cmd::simulate::status(&ctx)?;
                Ok(0)
            }
        },
        Commands::Branches { command } => match command {
            BranchCommands::Enable { base } => {
                cmd::branches::enable(&ctx, base.as_deref())?;
                Ok(0)
            }
            BranchCommands::Status => {
                cmd::branches::status(&ctx)?;
                Ok(0)
            }
            BranchCommands::Merge { strategy, target } => {
                cmd::branches::merge(&ctx, *strategy, target.as_deref())?;
                Ok(0)
            }
            BranchCommands::Cleanup { all } => {
                cmd::branches::cleanup(&ctx, *all)?;
                Ok(0)
            }
        },
        Commands::Diff { command } => match command {
            DiffCommands::Capture {
                root,
                exclude,
                output,
            } => {
                let config = ctx.store.get_config()?;
                cmd::diff::capture(root, exclude, output.as_deref(), &config)?;
                Ok(0)
            }
            DiffCommands::Compare {
                before,
                after,
                format,
            } => {
                cmd::diff::compare(before, after, *format)?;
                Ok(0)
            }
        },
        Commands::Contracts { command } => match command {
            ContractCommands::Create {
                id,
                rule_type,
                pattern,
                glob,
                message,
                severity,
                rationale,
                user,
            } => {
                cmd::contracts::create(
                    &ctx,
                    cmd::contracts::CreateArgs {
                        id: id.clone(),
                        rule_type: *rule_type,
                        pattern: pattern.clone(),
                        file_glob: glob.clone(),
                        message: message.clone(),
                        severity: *severity,
                        rationale: rationale.clone(),
                        user_scope: *user,
                    },
                )?;
                Ok(0)
            }
            ContractCommands::List { json } => {
                cmd::contracts::list(&ctx, *json)?;
                Ok(0)
            }
            ContractCommands::Check {
                fail_on_error,
                format,
            } => {
                let violations = cmd::contracts::check(&ctx, *format)?;
                Ok(if cmd::contracts::gate_failed(&violations, *fail_on_error) {
                    1
                } else {
                    0
                })
            }
            ContractCommands::Enable { id } => {
                cmd::contracts::set_enabled(&ctx, id, true)?;
                Ok(0)
            }
            ContractCommands::Disable { id } => {
                cmd::contracts::set_enabled(&ctx, id, false)?;
                Ok(0)
            }
            ContractCommands::Show { id } => {
                cmd::contracts::show(&ctx, id)?;
                Ok(0)
            }
        },
        Commands::Check {
            fail_on_error,
            format,
        } => {
            let violations = cmd::contracts::check(&ctx, *format)?;
            Ok(if cmd::contracts::gate_failed(&violations, *fail_on_error) {
                1
            } else {
                0
            })
        }
        Commands::Enforce {
            stdin: _,
            severity: _,
            command,
        } => match command {
            Some(EnforceCommands::Install {
                scope,
                dry_run,
                force,
            }) => {
                cmd::enforce::install(*scope, &ctx.root, *dry_run, *force)?;
                Ok(0)
            }
            None => {
                anyhow::bail!("enforce requires --stdin or the install subcommand")
            }
        },
        Commands::Negotiate { command } => dispatch_negotiate(&ctx, cli, command),
        Commands::Reverse {
            range,
            mode,
            strategy,
            format,
            max_phases,
        } => {
            cmd::reverse::run(&ctx, range, *mode, *strategy, *format, *max_phases)?;
            Ok(0)
        }
        Commands::Analytics { command } => match command {
            AnalyticsCommands::Show {
                last,
                since,
                until,
                status,
                document,
                format,
            } => {
                let args = cmd::analytics::QueryArgs {
                    last: *last,
                    since: since.clone(),
                    until: until.clone(),
                    status: *status,
                    document: document.clone(),
                };
                cmd::analytics::show(&ctx, &args, *format)?;
                Ok(0)
            }
            AnalyticsCommands::Import { report } => {
                cmd::analytics::import(&ctx, report)?;
                Ok(0)
            }
            AnalyticsCommands::Export {
                last,
                since,
                until,
                status,
                document,
                output,
            } => {
                let args = cmd::analytics::QueryArgs {
                    last: *last,
                    since: since.clone(),
                    until: until.clone(),
                    status: *status,
                    document: document.clone(),
                };
                cmd::analytics::export(&ctx, &args, output.as_deref())?;
                Ok(0)
            }
            AnalyticsCommands::Clear => {
                cmd::analytics::clear(&ctx, cli.yes)?;
                Ok(0)
            }
        },
        Commands::Replay {
            slug,
            scope,
            fail_on_regression,
        } => {
            let regressions = cmd::replay::run(&ctx, slug, *scope)?;
            Ok(if *fail_on_regression && !regressions.is_empty() {
                1
            } else {
                0
            })
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show { json } => {
                cmd::config::config_show(&ctx, *json)?;
                Ok(0)
            }
            ConfigCommands::Set { key, value } => {
                cmd::config::config_set(&ctx, key, value)?;
                Ok(0)
            }
            ConfigCommands::Reset => {
                cmd::config::config_reset(&ctx)?;
                Ok(0)
            }
        },
        Commands::Audits { command } => match command {
            AuditCommands::List { project, json } => {
                cmd::config::audits_list(&ctx, project.as_deref(), *json)?;
                Ok(0)
            }
            AuditCommands::Show { slug, json } => {
                cmd::config::audits_show(&ctx, slug, *json)?;
                Ok(0)
            }
            AuditCommands::Abandon { slug } => {
                cmd::config::audits_abandon(&ctx, slug, cli.yes)?;
                Ok(0)
            }
        },
        Commands::Events { command } => match command {
            EventCommands::List { audit, json } => {
                cmd::config::events_list(&ctx, audit.as_deref(), *json)?;
                Ok(0)
            }
            EventCommands::Clear { before } => {
                cmd::config::events_clear(&ctx, before.as_deref())?;
                Ok(0)
            }
        },
    }
}

fn dispatch_negotiate(ctx: &CmdContext, cli: &Cli, command: &NegotiateCommands) -> Result<i32> {
    use cmd::negotiate as neg;
    match command {
        NegotiateCommands::Open { file, ops } => {
            let mut engine = neg::open(ctx, file, cli.yes)?;
            if let Some(ops_path) = ops {
                let ops_yaml = std::fs::read_to_string(ops_path)?;
                let applied = neg::apply_ops(&mut engine, &ops_yaml)?;
                println!("Applied {} operation(s)", applied);
            }
            neg::save(ctx, &engine)?;
            neg::preview(&engine);
        }
        NegotiateCommands::Preview { file } => {
            let engine = neg::open(ctx, file, true)?;
            neg::preview(&engine);
        }
        NegotiateCommands::Skip { file, phase_id } => {
            let mut engine = neg::open(ctx, file, true)?;
            engine.skip(phase_id)?;
            neg::save(ctx, &engine)?;
        }
        NegotiateCommands::Unskip { file, phase_id } => {
            let mut engine = neg::open(ctx, file, true)?;
            engine.unskip(phase_id)?;
            neg::save(ctx, &engine)?;
        }
        NegotiateCommands::Apply { file, ops } => {
            let mut engine = neg::open(ctx, file, true)?;
            let ops_yaml = std::fs::read_to_string(ops)?;
            let applied = neg::apply_ops(&mut engine, &ops_yaml)?;
            neg::save(ctx, &engine)?;
            println!("Applied {} operation(s)", applied);
        }
        NegotiateCommands::Modify {
            file,
            phase_id,
            field,
            value,
        } => {
            let mut engine = neg::open(ctx, file, true)?;
            let value: serde_yaml::Value = serde_yaml::from_str(value)?;
            engine.modify(phase_id, *field, value)?;
            neg::save(ctx, &engine)?;
        }
        NegotiateCommands::Reset { file, scope } => {
            let mut engine = neg::open(ctx, file, true)?;
            engine.reset(scope)?;
            neg::save(ctx, &engine)?;
        }
        NegotiateCommands::Export {
            file,
            include_skipped,
            output,
        } => {
            let engine = neg::open(ctx, file, true)?;
            neg::export(&engine, *include_skipped, output.as_deref())?;
        }
        NegotiateCommands::Status { file } => {
            let engine = neg::open(ctx, file, true)?;
            neg::status(&engine);
        }
    }
    Ok(0)
}
