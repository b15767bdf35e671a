use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Number, Value};
use sitecost_migrate_core::{Item, MigrationMode};
use sitecost_migrate_pipeline::{MigrationApi, MigrationConfig, REPORT_CONTRACT_VERSION};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "scm")]
#[command(about = "SiteCost company-scope migration CLI")]
struct Cli {
    #[arg(long, default_value = "./sitecost_migration.sqlite3")]
    db: PathBuf,

    /// YAML file overriding table names, decommission resources and scan size.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot the source and membership tables into a timestamped directory.
    Backup(BackupArgs),
    /// Copy user-scoped records into the company-scoped tables.
    Migrate(MigrateArgs),
    /// Check every source record against its migrated copy.
    Validate(ValidateArgs),
    /// Delete the legacy handlers, then the legacy tables.
    Decommission(DecommissionArgs),
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ModeArgs {
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    execute: bool,
}

impl ModeArgs {
    fn mode(&self) -> MigrationMode {
        if self.execute {
            MigrationMode::Execute
        } else {
            MigrationMode::DryRun
        }
    }
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[command(flatten)]
    mode: ModeArgs,
    /// Read source records from a backup directory instead of the live tables.
    #[arg(long)]
    from_snapshot: Option<PathBuf>,
    #[arg(long, default_value = "./migration-reports")]
    report_dir: PathBuf,
    /// Fail records whose owner has no company membership instead of falling back.
    #[arg(long, default_value_t = false)]
    strict: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long, default_value = "./migration-reports")]
    report_dir: PathBuf,
}

#[derive(Debug, Args)]
struct DecommissionArgs {
    #[command(flatten)]
    mode: ModeArgs,
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    Init,
    Import(StoreImportArgs),
    Scan(StoreScanArgs),
    SchemaVersion,
}

#[derive(Debug, Args)]
struct StoreImportArgs {
    #[arg(long)]
    table: String,
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct StoreScanArgs {
    #[arg(long)]
    table: String,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    AddExpense(AddExpenseArgs),
    AddProject(AddProjectArgs),
    AddContractor(AddContractorArgs),
    AddWork(AddWorkArgs),
}

#[derive(Debug, Args)]
struct AddExpenseArgs {
    #[arg(long)]
    company: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    expense_id: Option<String>,
    #[arg(long)]
    amount: String,
    #[arg(long)]
    date: String,
    #[arg(long)]
    invoice: String,
    #[arg(long)]
    payment_method: String,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    contractor: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
struct AddProjectArgs {
    #[arg(long)]
    company: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    project_id: Option<String>,
    #[arg(long)]
    name: String,
    #[arg(long)]
    start_date: String,
    #[arg(long)]
    end_date: Option<String>,
    #[arg(long)]
    budget: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
struct AddContractorArgs {
    #[arg(long)]
    company: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    contractor_id: Option<String>,
    #[arg(long)]
    name: String,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Args)]
struct AddWorkArgs {
    #[arg(long)]
    company: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    work_id: Option<String>,
    #[arg(long)]
    project: String,
    #[arg(long)]
    contractor: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    total_cost: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    expense: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // A missing --dry-run/--execute lands here, before any work is done. Usage errors
            // exit 1 like every other failure, so clap's `exit()` (code 2) is not used.
            let printed = err.print().is_ok();
            return if printed && !err.use_stderr() { ExitCode::SUCCESS } else { ExitCode::FAILURE };
        }
    };
    init_tracing();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run one command; `Ok(false)` means it completed but reported failures.
fn run(cli: Cli) -> Result<bool> {
    let config = MigrationConfig::load(cli.config.as_deref())?;
    let api = MigrationApi::new(cli.db, config);

    match cli.command {
        Command::Backup(args) => run_backup(&api, &args),
        Command::Migrate(args) => run_migrate(&api, &args),
        Command::Validate(args) => run_validate(&api, &args),
        Command::Decommission(args) => run_decommission(&api, &args),
        Command::Store { command } => run_store(&api, command),
        Command::Ledger { command } => run_ledger(&api, *command),
    }
}

fn run_backup(api: &MigrationApi, args: &BackupArgs) -> Result<bool> {
    let summary = api.backup(&args.out)?;
    let succeeded = summary.succeeded();
    emit_json(serde_json::json!({
        "report_contract_version": REPORT_CONTRACT_VERSION,
        "success": succeeded,
        "summary": summary
    }))?;
    Ok(succeeded)
}

fn run_migrate(api: &MigrationApi, args: &MigrateArgs) -> Result<bool> {
    let options = api.driver_options(args.mode.mode(), args.strict);
    let outcome = api.migrate(options, args.from_snapshot.as_deref(), &args.report_dir)?;
    let succeeded = outcome.report.succeeded();
    emit_json(serde_json::json!({
        "report_contract_version": REPORT_CONTRACT_VERSION,
        "success": succeeded,
        "report_path": outcome.report_path,
        "report": outcome.report
    }))?;
    Ok(succeeded)
}

fn run_validate(api: &MigrationApi, args: &ValidateArgs) -> Result<bool> {
    let outcome = api.validate(&args.report_dir)?;
    let succeeded = outcome.report.summary.all_success;
    emit_json(serde_json::json!({
        "report_contract_version": REPORT_CONTRACT_VERSION,
        "success": succeeded,
        "report_path": outcome.report_path,
        "report": outcome.report
    }))?;
    Ok(succeeded)
}

fn run_decommission(api: &MigrationApi, args: &DecommissionArgs) -> Result<bool> {
    let mode = args.mode.mode();
    if mode == MigrationMode::Execute {
        tracing::warn!("decommission deletes legacy resources; run it only after a clean validation report");
    }
    let report = api.decommission(mode)?;
    let succeeded = report.succeeded();
    emit_json(serde_json::json!({
        "report_contract_version": REPORT_CONTRACT_VERSION,
        "success": succeeded,
        "report": report
    }))?;
    Ok(succeeded)
}

fn run_store(api: &MigrationApi, command: StoreCommand) -> Result<bool> {
    match command {
        StoreCommand::Init => {
            let result = api.init_store()?;
            emit_json(serde_json::to_value(result)?)?;
        }
        StoreCommand::Import(args) => {
            let result = api.import(&args.table, &args.input)?;
            emit_json(serde_json::to_value(result)?)?;
        }
        StoreCommand::Scan(args) => {
            let items = api.scan(&args.table)?;
            emit_json(serde_json::json!({
                "table": args.table,
                "count": items.len(),
                "items": items
            }))?;
        }
        StoreCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))?;
        }
    }
    Ok(true)
}

fn run_ledger(api: &MigrationApi, command: LedgerCommand) -> Result<bool> {
    let (entity, record) = match command {
        LedgerCommand::AddExpense(args) => {
            let mut item = Item::new();
            insert_optional(&mut item, "userId", args.user);
            insert_optional(&mut item, "expenseId", args.expense_id);
            item.insert("amount".to_string(), parse_number("amount", &args.amount)?);
            item.insert("date".to_string(), Value::String(args.date));
            item.insert("invoiceNum".to_string(), Value::String(args.invoice));
            item.insert("paymentMethod".to_string(), Value::String(args.payment_method));
            insert_optional(&mut item, "projectId", args.project);
            insert_optional(&mut item, "contractorId", args.contractor);
            insert_optional(&mut item, "description", args.description);
            ("expense", api.add_expense(&args.company, item)?)
        }
        LedgerCommand::AddProject(args) => {
            let mut item = Item::new();
            insert_optional(&mut item, "userId", args.user);
            insert_optional(&mut item, "projectId", args.project_id);
            item.insert("name".to_string(), Value::String(args.name));
            item.insert("startDate".to_string(), Value::String(args.start_date));
            insert_optional(&mut item, "endDate", args.end_date);
            if let Some(budget) = args.budget {
                item.insert("budget".to_string(), parse_number("budget", &budget)?);
            }
            insert_optional(&mut item, "description", args.description);
            insert_optional(&mut item, "status", args.status);
            ("project", api.add_project(&args.company, item)?)
        }
        LedgerCommand::AddContractor(args) => {
            let mut item = Item::new();
            insert_optional(&mut item, "userId", args.user);
            insert_optional(&mut item, "contractorId", args.contractor_id);
            item.insert("name".to_string(), Value::String(args.name));
            insert_optional(&mut item, "phone", args.phone);
            ("contractor", api.add_contractor(&args.company, item)?)
        }
        LedgerCommand::AddWork(args) => {
            let mut item = Item::new();
            insert_optional(&mut item, "userId", args.user);
            insert_optional(&mut item, "workId", args.work_id);
            item.insert("projectId".to_string(), Value::String(args.project));
            item.insert("contractorId".to_string(), Value::String(args.contractor));
            item.insert("WorkName".to_string(), Value::String(args.name));
            item.insert("TotalWorkCost".to_string(), parse_number("total-cost", &args.total_cost)?);
            insert_optional(&mut item, "description", args.description);
            insert_optional(&mut item, "status", args.status);
            insert_optional(&mut item, "expenseId", args.expense);
            ("work", api.add_work(&args.company, item)?)
        }
    };

    emit_json(serde_json::json!({ "entity": entity, "record": record }))?;
    Ok(true)
}

fn insert_optional(item: &mut Item, attribute: &str, value: Option<String>) {
    if let Some(value) = value {
        item.insert(attribute.to_string(), Value::String(value));
    }
}

/// Keep integers as integers so stored amounts compare exactly after migration.
fn parse_number(flag: &str, raw: &str) -> Result<Value> {
    let number: Number = serde_json::from_str(raw.trim())
        .with_context(|| format!("--{flag} must be a number, got {raw:?}"))?;
    if number.as_f64().is_some_and(f64::is_finite) {
        Ok(Value::Number(number))
    } else {
        Err(anyhow!("--{flag} must be a finite number, got {raw:?}"))
    }
}
