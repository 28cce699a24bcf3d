use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rowtally_catalog::{
    column_day_ranges, partition_entries, required_columns, table_day_ranges, BigQueryClient, CopyOperation,
    CopyPlanner, Pipeline, RedshiftClient, WarehouseClient,
};
use rowtally_core::{
    load_counts, load_series, parse_day, persist_series, Config, DayRangeEntry, FilterSettings, PartitionEntry,
    TableColumn, WarehouseKind,
};
use rowtally_engine::{
    print_summary, ColumnItem, DiffReport, DirectorySink, Printer, Reconciler, RowCountExtractor, StatsExtractor,
    Validated, Validator,
};

/// Password variable used when a Redshift project names none
const DEFAULT_PASSWORD_ENV: &str = "ROWTALLY_RS_PASSWORD";

/// Rowtally - Row count and distribution reconciliation between Redshift and BigQuery
#[derive(Parser)]
#[command(name = "rowtally")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: rowtally.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for every artifact read or written
    #[arg(short = 'd', long, global = true, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Warehouse {
    /// Redshift
    Rs,
    /// BigQuery
    Bq,
}

impl Warehouse {
    fn kind(self) -> WarehouseKind {
        match self {
            Warehouse::Rs => WarehouseKind::Redshift,
            Warehouse::Bq => WarehouseKind::BigQuery,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TableKind {
    /// Tables with a time column, with day bounds per table and per column
    Daily,
    /// Tables without a time column, with the column to count
    Whole,
    /// Daily partitions of time-partitioned tables
    Partitions,
}

#[derive(Clone, Copy, ValueEnum)]
enum CountMode {
    /// Rows per day of every time-partitioned table
    Daily,
    /// Rows of every table without a time column
    Whole,
}

#[derive(Clone, Copy, ValueEnum)]
enum DistMode {
    /// Min, max, null, non-null and distinct counts
    Basic,
    /// Quantiles of the normalized values
    Percentiles,
}

#[derive(Clone, Copy, ValueEnum)]
enum Operation {
    Backup,
    Restore,
    Copy,
    Reverse,
    Clean,
    Drop,
}

impl Operation {
    fn copy_operation(self) -> CopyOperation {
        match self {
            Operation::Backup => CopyOperation::Backup,
            Operation::Restore => CopyOperation::Restore,
            Operation::Copy => CopyOperation::Copy,
            Operation::Reverse => CopyOperation::Reverse,
            Operation::Clean => CopyOperation::Clean,
            Operation::Drop => CopyOperation::DropOriginals,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and filter tables, writing the table artifacts
    Tables {
        #[arg(value_enum)]
        warehouse: Warehouse,

        /// Project name in the config file
        project: String,

        #[arg(short, long, value_enum, default_value = "daily")]
        kind: TableKind,
    },

    /// Count rows per day or per table
    Count {
        #[arg(value_enum)]
        warehouse: Warehouse,

        project: String,

        /// Upper bound day (YYYYMMDD) replacing the discovered end days
        end_day: Option<String>,

        #[arg(short, long, value_enum, default_value = "daily")]
        mode: CountMode,

        /// Time column of daily counts (default: each table's configured time column)
        #[arg(long)]
        column: Option<String>,

        /// Table artifact to read
        #[arg(long = "in")]
        input: Option<PathBuf>,
    },

    /// Extract column statistics, one file per table
    Dist {
        #[arg(value_enum)]
        warehouse: Warehouse,

        project: String,

        #[arg(short, long, value_enum, default_value = "basic")]
        mode: DistMode,

        /// Upper bound day (YYYYMMDD) replacing the discovered end days
        #[arg(long)]
        end_day: Option<String>,

        /// Column artifact to read
        #[arg(long = "in")]
        input: Option<PathBuf>,
    },

    /// Compare the row counts of both warehouses
    Diff {
        project: String,

        /// Reference count series (default: the Redshift daily counts)
        #[arg(long)]
        a: Option<PathBuf>,

        /// Checked count series (default: the BigQuery daily counts)
        #[arg(long)]
        b: Option<PathBuf>,

        /// Partition artifact marking rows to rerun
        #[arg(long)]
        partitions: Option<PathBuf>,

        #[arg(long, default_value = "summary",
              value_parser = ["summary", "absolute", "relative", "table-relative", "missing"])]
        validator: String,

        /// Threshold of the validator (default depends on the validator)
        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long, default_value = "pretty", value_parser = ["pretty", "csv-all", "csv-rerun", "json"])]
        printer: String,

        /// Write the output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Back up, restore, copy or drop the tables of a dataset
    Backup {
        #[arg(value_enum)]
        warehouse: Warehouse,

        project: String,

        #[arg(value_enum)]
        operation: Operation,

        /// Tables left alone (their copies and backups too)
        #[arg(long, value_delimiter = ',')]
        ignore: Vec<String>,

        /// Only these tables (and their copies and backups)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Print the statements without running them
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else if Path::new("rowtally.toml").exists() {
        Config::from_file(Path::new("rowtally.toml"))?
    } else {
        tracing::warn!("no config file found, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Tables { warehouse, project, kind } => {
            tables_command(&config, &cli.dir, warehouse, &project, kind).await
        }
        Commands::Count { warehouse, project, end_day, mode, column, input } => {
            count_command(&config, &cli.dir, warehouse, &project, end_day.as_deref(), mode, column, input).await
        }
        Commands::Dist { warehouse, project, mode, end_day, input } => {
            dist_command(&config, &cli.dir, warehouse, &project, mode, end_day.as_deref(), input).await
        }
        Commands::Diff { project, a, b, partitions, validator, threshold, printer, output } => diff_command(
            &config,
            &cli.dir,
            &project,
            DiffInputs { a, b, partitions },
            &validator,
            threshold,
            &printer,
            output.as_deref(),
        ),
        Commands::Backup { warehouse, project, operation, ignore, only, dry_run } => {
            backup_command(&config, warehouse, &project, operation, &ignore, &only, dry_run).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// `<dir>/<tag>_<project>_<name>.csv`
fn artifact(dir: &Path, warehouse: Warehouse, project: &str, name: &str) -> PathBuf {
    dir.join(format!("{}_{}_{}.csv", warehouse.kind().tag(), project, name))
}

fn filters<'a>(config: &'a Config, project: &str, warehouse: Warehouse) -> Result<&'a FilterSettings> {
    Ok(config.project(project)?.filters(warehouse.kind())?)
}

fn parse_end_day(end_day: Option<&str>) -> Result<Option<chrono::NaiveDate>> {
    Ok(end_day.map(parse_day).transpose()?)
}

/// Connect to a project's warehouse and check the connection
async fn connect(config: &Config, project: &str, warehouse: Warehouse) -> Result<Arc<dyn WarehouseClient>> {
    let settings = config.project(project)?;

    let client: Arc<dyn WarehouseClient> = match warehouse {
        Warehouse::Rs => {
            let redshift = settings.redshift()?;
            let variable = redshift.password_env.as_deref().unwrap_or(DEFAULT_PASSWORD_ENV);
            let password = std::env::var(variable)
                .with_context(|| format!("Redshift password variable {} is not set", variable))?;
            Arc::new(RedshiftClient::from_settings(redshift, &password).await?)
        }
        Warehouse::Bq => {
            let mut bigquery = settings.bigquery()?.clone();
            bigquery.credentials = bigquery.credentials.map(|path| config.resolve_path(&path));
            Arc::new(BigQueryClient::from_settings(&bigquery).await?)
        }
    };

    tracing::info!(warehouse = client.name(), dataset = client.dataset(), "testing connection");
    client
        .test_connection()
        .await
        .with_context(|| format!("Failed to connect to {}", client.name()))?;
    eprintln!("{} {} ({})", "✓ Connected to".green(), client.name(), client.dataset());

    Ok(client)
}

async fn tables_command(config: &Config, dir: &Path, warehouse: Warehouse, project: &str, kind: TableKind) -> Result<()> {
    let client = connect(config, project, warehouse).await?;
    let filters = filters(config, project, warehouse)?;
    let tables = client.list_tables(client.dataset()).await.context("Table listing failed")?;
    eprintln!("{} {} tables", "Listed".cyan(), tables.len());

    match kind {
        TableKind::Daily => {
            let results = Pipeline::daily(client.clone(), filters).run(&tables).await?;
            let table_path = artifact(dir, warehouse, project, "tables_daily");
            let column_path = artifact(dir, warehouse, project, "columns_daily");
            persist_series(&table_day_ranges(&results), &table_path)?;
            persist_series(&column_day_ranges(&results), &column_path)?;
            print_written(results.len(), &[table_path.as_path(), column_path.as_path()]);
        }
        TableKind::Whole => {
            let results = Pipeline::whole(filters).run(&tables).await?;
            let path = artifact(dir, warehouse, project, "tables_whole");
            persist_series(&required_columns(&results), &path)?;
            print_written(results.len(), &[path.as_path()]);
        }
        TableKind::Partitions => {
            let results = Pipeline::partitions(client.clone(), filters).run(&tables).await?;
            let path = artifact(dir, warehouse, project, "table_partitions");
            persist_series(&partition_entries(&results), &path)?;
            print_written(results.len(), &[path.as_path()]);
        }
    }

    Ok(())
}

fn print_written(tables: usize, paths: &[&Path]) {
    println!("{} {} tables", "Kept".bold(), tables);
    for path in paths {
        println!("  {} {}", "✓".green(), path.display());
    }
}

#[allow(clippy::too_many_arguments)]
async fn count_command(
    config: &Config,
    dir: &Path,
    warehouse: Warehouse,
    project: &str,
    end_day: Option<&str>,
    mode: CountMode,
    column: Option<String>,
    input: Option<PathBuf>,
) -> Result<()> {
    let filters = filters(config, project, warehouse)?;
    let end = parse_end_day(end_day)?;
    let client = connect(config, project, warehouse).await?;

    let time_columns = column.map(|c| vec![c]).unwrap_or_else(|| filters.time_columns.clone());
    let extractor = RowCountExtractor::new(client.clone(), &config.extraction, &time_columns);

    let (counts, path) = match mode {
        CountMode::Daily => {
            let input = input.unwrap_or_else(|| artifact(dir, warehouse, project, "tables_daily"));
            let entries: Vec<DayRangeEntry> =
                load_series(&input).with_context(|| format!("Failed to read {}", input.display()))?;
            let tables = client.list_tables(client.dataset()).await.context("Table listing failed")?;
            let counts = extractor.daily(&tables, &entries, end, &filters.ignore_tables).await?;
            (counts, artifact(dir, warehouse, project, "table_daily_rows"))
        }
        CountMode::Whole => {
            let input = input.unwrap_or_else(|| artifact(dir, warehouse, project, "tables_whole"));
            let entries: Vec<TableColumn> =
                load_series(&input).with_context(|| format!("Failed to read {}", input.display()))?;
            let counts = extractor.whole(&entries).await?;
            (counts, artifact(dir, warehouse, project, "table_rows"))
        }
    };

    persist_series(&counts, &path)?;
    println!("{} {} counts", "✓".green(), counts.len());
    println!("  {}", path.display());
    Ok(())
}

async fn dist_command(
    config: &Config,
    dir: &Path,
    warehouse: Warehouse,
    project: &str,
    mode: DistMode,
    end_day: Option<&str>,
    input: Option<PathBuf>,
) -> Result<()> {
    let filters = filters(config, project, warehouse)?;
    let end = parse_end_day(end_day)?;

    let input = input.unwrap_or_else(|| artifact(dir, warehouse, project, "columns_daily"));
    let entries: Vec<DayRangeEntry> =
        load_series(&input).with_context(|| format!("Failed to read {}", input.display()))?;
    let items = ColumnItem::from_ranges(&entries, end)?;

    let client = connect(config, project, warehouse).await?;
    let tables = client.list_tables(client.dataset()).await.context("Table listing failed")?;

    let extractor = StatsExtractor::new(client, &config.extraction, &filters.time_columns);
    let mut sink = DirectorySink::new(dir, format!("{}_{}", warehouse.kind().tag(), project));
    let summary = match mode {
        DistMode::Basic => extractor.basic_stats(&tables, &items, &mut sink).await?,
        DistMode::Percentiles => extractor.percentiles(&tables, &items, &mut sink).await?,
    };

    println!(
        "{} {} columns of {} tables",
        "✓ Extracted".green(),
        summary.items,
        summary.tables
    );
    if summary.missing > 0 {
        println!("  {} {} columns returned no usable result", "⚠".yellow(), summary.missing);
    }
    for path in sink.written() {
        println!("  {}", path.display());
    }
    Ok(())
}

struct DiffInputs {
    a: Option<PathBuf>,
    b: Option<PathBuf>,
    partitions: Option<PathBuf>,
}

#[allow(clippy::too_many_arguments)]
fn diff_command(
    config: &Config,
    dir: &Path,
    project: &str,
    inputs: DiffInputs,
    validator: &str,
    threshold: Option<f64>,
    printer: &str,
    output: Option<&Path>,
) -> Result<()> {
    let settings = config.project(project)?;

    let validator = Validator::from_name(validator).with_context(|| format!("Unknown validator '{}'", validator))?;
    let validator = match threshold {
        Some(threshold) => validator.with_threshold(threshold),
        None => validator,
    };
    let printer = Printer::from_name(printer).with_context(|| format!("Unknown printer '{}'", printer))?;

    let path_a = inputs.a.unwrap_or_else(|| artifact(dir, Warehouse::Rs, project, "table_daily_rows"));
    let path_b = inputs.b.unwrap_or_else(|| artifact(dir, Warehouse::Bq, project, "table_daily_rows"));
    let series_a = load_counts(&path_a).with_context(|| format!("Failed to read {}", path_a.display()))?;
    let series_b = load_counts(&path_b).with_context(|| format!("Failed to read {}", path_b.display()))?;

    let partitions_path = inputs
        .partitions
        .or_else(|| Some(artifact(dir, Warehouse::Bq, project, "table_partitions")).filter(|p| p.exists()));
    let partitions: Vec<PartitionEntry> = match &partitions_path {
        Some(path) => load_series(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => Vec::new(),
    };

    let rows = Reconciler::new()
        .with_ignored_tables(settings.diff.ignore_tables.clone())
        .with_partitions(&partitions)?
        .reconcile(&series_a, &series_b)?;
    tracing::info!(rows = rows.len(), "joined count series");

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };

    match validator.apply(&rows) {
        Validated::Summary(summary) => print_summary(&mut out, &summary)?,
        Validated::Rows(kept) => {
            let status_threshold = validator.classification_threshold();
            printer.print(&mut out, &kept, status_threshold)?;
            let report = DiffReport::from_records(&rows, status_threshold);
            eprintln!(
                "{} {} of {} rows kept ({} matched, {} missing, {} divergent)",
                "Diff:".bold(),
                kept.len(),
                rows.len(),
                report.summary.matched,
                format!("{}", report.summary.missing).yellow(),
                format!("{}", report.summary.divergent).red(),
            );
        }
    }
    out.flush()?;

    Ok(())
}

async fn backup_command(
    config: &Config,
    warehouse: Warehouse,
    project: &str,
    operation: Operation,
    ignore: &[String],
    only: &[String],
    dry_run: bool,
) -> Result<()> {
    let filters = filters(config, project, warehouse)?;
    let client = connect(config, project, warehouse).await?;
    let tables = client.list_tables(client.dataset()).await.context("Table listing failed")?;

    let operation = operation.copy_operation();
    let planner = CopyPlanner::new(client.clone()).with_excluded_columns(filters.ignore_columns.clone());
    let selected = planner.select(operation, &tables, ignore, only);
    eprintln!("{} {} tables for {}", "Selected".cyan(), selected.len(), operation.name());

    if dry_run {
        for table in &selected {
            let plan = planner.plan(operation, table).await?;
            println!("-- {} -> {}", plan.source, plan.dest.as_deref().unwrap_or("(dropped)"));
            for statement in &plan.statements {
                println!("{};", statement);
            }
        }
        return Ok(());
    }

    let done = planner.execute(operation, &selected).await?;
    for plan in &done {
        println!(
            "  {} {} -> {} ({} statements)",
            "✓".green(),
            plan.source,
            plan.dest.as_deref().unwrap_or("(dropped)"),
            plan.statements.len()
        );
    }
    Ok(())
}
