use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use compliance_kernel_api::{load_corpus_bundle, ComplianceKernelApi, KernelConfig};
use compliance_kernel_core::dates::parse_date;
use compliance_kernel_core::{ClientContext, Query, Surface};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Compliance Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./compliance_kernel.sqlite3")]
    db: PathBuf,

    /// Optional YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
    Rollout {
        #[command(subcommand)]
        command: RolloutCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Import(DbImportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    /// Corpus bundle JSON with `concepts`, `rules` and `evidence`.
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Ask(AskArgs),
    Events(EventsArgs),
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    text: String,
    #[arg(long, value_enum, default_value_t = SurfaceArg::InApp)]
    surface: SurfaceArg,
    #[arg(long)]
    company_id: Option<String>,
    /// Client context as a JSON file; individual flags below override its fields.
    #[arg(long)]
    client_file: Option<PathBuf>,
    #[arg(long)]
    legal_form: Option<String>,
    #[arg(long)]
    vat_status: Option<String>,
    #[arg(long)]
    revenue_ytd: Option<f64>,
    #[arg(long)]
    employees: Option<u32>,
    #[arg(long)]
    jurisdiction: Option<String>,
    /// RFC 3339 instant or `YYYY-MM-DD` date; defaults to now.
    #[arg(long)]
    as_of: Option<String>,
    /// Print one JSON event per line as the run progresses.
    #[arg(long, default_value_t = false)]
    stream: bool,
}

#[derive(Debug, Args)]
struct EventsArgs {
    #[arg(long)]
    request_id: String,
}

#[derive(Debug, Subcommand)]
enum RolloutCommand {
    Bucket(BucketArgs),
}

#[derive(Debug, Args)]
struct BucketArgs {
    #[arg(long)]
    key: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SurfaceArg {
    Marketing,
    InApp,
}

impl SurfaceArg {
    fn into_surface(self) -> Surface {
        match self {
            Self::Marketing => Surface::Marketing,
            Self::InApp => Surface::InApp,
        }
    }
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

fn emit_line(value: Value) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string(&with_contract_version(value))?)?;
    stdout.flush().context("failed to flush stdout")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = KernelConfig::load(cli.config.as_deref())?;
    let api = ComplianceKernelApi::with_config(cli.db, config);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Query { command } => run_query(*command, &api),
        Command::Rollout { command } => run_rollout(command, &api),
    }
}

fn run_db(command: DbCommand, api: &ComplianceKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result).context("failed to serialize migrate result")?)
        }
        DbCommand::Import(args) => {
            let bundle = load_corpus_bundle(&args.input)?;
            let result = api.import_corpus(&bundle)?;
            emit_json(serde_json::to_value(result).context("failed to serialize import result")?)
        }
    }
}

fn run_query(command: QueryCommand, api: &ComplianceKernelApi) -> Result<()> {
    match command {
        QueryCommand::Ask(args) => {
            let stream = args.stream;
            let query = build_query(args)?;
            if stream {
                let mut write_error = None;
                let response = api.ask_streaming(query, |event| {
                    if write_error.is_some() {
                        return;
                    }
                    let emitted = serde_json::to_value(event)
                        .context("failed to serialize reasoning event")
                        .and_then(emit_line);
                    if let Err(err) = emitted {
                        write_error = Some(err);
                    }
                })?;
                if let Some(err) = write_error {
                    return Err(err);
                }
                return emit_line(serde_json::json!({
                    "request_id": response.request_id,
                    "variant": response.variant,
                    "terminal": response.terminal,
                }));
            }
            let response = api.ask(query)?;
            emit_json(serde_json::to_value(response).context("failed to serialize ask response")?)
        }
        QueryCommand::Events(args) => {
            let events = api.events(&args.request_id)?;
            emit_json(serde_json::json!({
                "request_id": args.request_id,
                "events": events,
            }))
        }
    }
}

fn run_rollout(command: RolloutCommand, api: &ComplianceKernelApi) -> Result<()> {
    match command {
        RolloutCommand::Bucket(args) => {
            emit_json(serde_json::to_value(api.rollout(&args.key)).context("failed to serialize rollout")?)
        }
    }
}

fn build_query(args: AskArgs) -> Result<Query> {
    let mut client = match args.client_file.as_ref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read client file {}", path.display()))?;
            Some(
                serde_json::from_str::<ClientContext>(&raw)
                    .with_context(|| format!("invalid client file {}", path.display()))?,
            )
        }
        None => None,
    };

    let has_flags = args.legal_form.is_some()
        || args.vat_status.is_some()
        || args.revenue_ytd.is_some()
        || args.employees.is_some()
        || args.jurisdiction.is_some();
    if has_flags {
        let target = client.get_or_insert_with(ClientContext::default);
        if args.legal_form.is_some() {
            target.legal_form = args.legal_form;
        }
        if args.vat_status.is_some() {
            target.vat_status = args.vat_status;
        }
        if args.revenue_ytd.is_some() {
            target.revenue_ytd = args.revenue_ytd;
        }
        if args.employees.is_some() {
            target.employees = args.employees;
        }
        if args.jurisdiction.is_some() {
            target.jurisdiction = args.jurisdiction;
        }
    }

    let mut query = Query::new(args.text).with_surface(args.surface.into_surface());
    query.company_id = args.company_id;
    query.client = client;
    if let Some(raw) = args.as_of.as_deref() {
        query = query.with_as_of(parse_as_of(raw)?);
    }
    Ok(query)
}

fn parse_as_of(value: &str) -> Result<OffsetDateTime> {
    if let Ok(instant) = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339) {
        return Ok(instant);
    }
    parse_date(value)
        .map(|date| date.midnight().assume_utc())
        .ok_or_else(|| anyhow!("invalid --as-of value (expected RFC3339 or YYYY-MM-DD): {value}"))
}
