use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tasks::editor::{CursorPosition, EditorSurface, LineBuffer, toggle_at_cursor};
use tasks::parser::{DateFallback, ParseContext, parse_document};
use tasks::query::{Query, TaskGroups};
use tasks::status::StatusRegistry;
use tasks::toggle::ToggleOutcome;
use tasks::{Task, TasksConfig};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "tasks.toml";

#[derive(Debug, Parser)]
#[command(
    name = "tasks",
    about = "Query and toggle tasks embedded in Markdown notes",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides).
    #[arg(long, global = true)]
    verbose: bool,
    /// Path to tasks.toml. Defaults to ./tasks.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Markdown files and list the tasks they contain.
    Parse(ParseArgs),

    /// Run a query over the tasks of one or more Markdown files.
    Query(QueryArgs),

    /// Toggle the task (or line) at a position in a file.
    Toggle(ToggleArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown files or directories containing Markdown files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of one line per task.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// Query source, one instruction per line.
    #[arg(long, conflicts_with = "query_file", required_unless_present = "query_file")]
    query: Option<String>,
    /// Read the query source from a file.
    #[arg(long)]
    query_file: Option<PathBuf>,
    /// Markdown files or directories containing Markdown files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Date used for relative filters (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Emit JSON instead of grouped text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    /// Markdown file to edit.
    file: PathBuf,
    /// One-based line number.
    #[arg(long)]
    line: usize,
    /// Zero-based cursor column on that line.
    #[arg(long, default_value_t = 0)]
    cursor: usize,
    /// Completion date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Overwrite the file instead of printing the replacement lines.
    #[arg(long)]
    in_place: bool,
}

/// Loaded configuration: status registry plus date fallback.
struct Settings {
    statuses: StatusRegistry,
    date_fallback: Box<dyn DateFallback>,
}

impl Settings {
    fn context(&self) -> ParseContext<'_> {
        ParseContext::new(&self.statuses).with_date_fallback(self.date_fallback.as_ref())
    }
}

/// Filter used when `RUST_LOG` is unset.
fn default_filter(verbose: bool) -> &'static str {
    if verbose { "tasks=debug" } else { "tasks=info" }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings(cli.config.as_deref())?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &settings),
        Commands::Query(args) => handle_query(args, &settings),
        Commands::Toggle(args) => handle_toggle(args, &settings),
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let config = match path {
        Some(path) => read_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => read_config(Path::new(DEFAULT_CONFIG))?,
        None => TasksConfig::default(),
    };
    Ok(Settings {
        statuses: config.status_registry()?,
        date_fallback: config.date_fallback(),
    })
}

fn read_config(path: &Path) -> Result<TasksConfig> {
    debug!(?path, "loading config");
    let text = fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
    TasksConfig::from_toml_str(&text).with_context(|| format!("parsing config {:?}", path))
}

fn handle_parse(args: ParseArgs, settings: &Settings) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = load_tasks(&inputs, settings)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            tasks: &'a [Task],
        }

        let payload: Vec<_> = parsed
            .iter()
            .map(|(path, tasks)| JsonOutput {
                path: path.display().to_string(),
                tasks,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, tasks) in &parsed {
            println!("{} ({} tasks)", path.display(), tasks.len());
            for task in tasks {
                println!(
                    "  {}: [{}] {}",
                    task.location.line_number + 1,
                    task.status.name,
                    task.description
                );
            }
        }
    }
    Ok(())
}

fn handle_query(args: QueryArgs, settings: &Settings) -> Result<()> {
    let QueryArgs {
        query,
        query_file,
        inputs,
        date,
        json,
    } = args;
    let source = match (query, query_file) {
        (Some(source), _) => source,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("reading query {:?}", path))?,
        (None, None) => anyhow::bail!("either --query or --query-file is required"),
    };
    let query = Query::parse(&source)?;
    let today = date.unwrap_or_else(|| Local::now().date_naive());

    let tasks: Vec<Task> = load_tasks(&inputs, settings)?
        .into_iter()
        .flat_map(|(_, tasks)| tasks)
        .collect();
    let groups = query.apply(&tasks, today);

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
    } else {
        print!("{}", render_groups(&groups));
    }
    Ok(())
}

fn render_groups(groups: &TaskGroups) -> String {
    let mut out = String::new();
    for group in groups.iter() {
        if !group.keys.is_empty() {
            out.push_str(&format!("## {}\n", group.keys.join(" > ")));
        }
        for task in &group.tasks {
            out.push_str(&format!(
                "{}:{}: {}\n",
                task.location.path,
                task.location.line_number + 1,
                task.original_markdown.trim()
            ));
        }
    }
    out.push_str(&format!("{} tasks\n", groups.total_tasks()));
    out
}

fn handle_toggle(args: ToggleArgs, settings: &Settings) -> Result<()> {
    let ToggleArgs {
        file,
        line,
        cursor,
        date,
        in_place,
    } = args;
    let today = date.unwrap_or_else(|| Local::now().date_naive());
    let (buffer, outcome) = toggle_file(&file, line, cursor, today, settings)?;
    let pos = buffer.cursor();
    info!(kind = ?outcome.kind, line = pos.line + 1, ch = pos.ch, "toggled");

    if in_place {
        fs::write(&file, buffer.text()).with_context(|| format!("writing {:?}", file))?;
    } else {
        println!("{}", outcome.text);
    }
    Ok(())
}

fn toggle_file(
    file: &Path,
    line: usize,
    cursor: usize,
    today: NaiveDate,
    settings: &Settings,
) -> Result<(LineBuffer, ToggleOutcome)> {
    if line == 0 {
        anyhow::bail!("line numbers start at 1");
    }
    let text = fs::read_to_string(file).with_context(|| format!("reading {:?}", file))?;
    let mut buffer = LineBuffer::from_text(&text);
    buffer.set_cursor(CursorPosition {
        line: line - 1,
        ch: cursor,
    });
    let path = file.display().to_string();
    let outcome = toggle_at_cursor(&mut buffer, &path, &settings.context(), today)
        .with_context(|| format!("line {line} is outside {:?} ({} lines)", file, buffer.len()))?;
    Ok((buffer, outcome))
}

fn load_tasks(inputs: &[PathBuf], settings: &Settings) -> Result<Vec<(PathBuf, Vec<Task>)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Markdown files found in the provided inputs");
    }

    let ctx = settings.context();
    let mut parsed = Vec::new();
    for path in expanded {
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let tasks = parse_document(&path.display().to_string(), &text, &ctx);
        parsed.push((path, tasks));
    }
    Ok(parsed)
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if seen.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if is_markdown(&canonical) {
            if seen.insert(canonical.clone()) {
                out.push(canonical);
            }
        } else {
            anyhow::bail!("{:?} is not a .md file", canonical);
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        out.push(canonical);
    }
    Ok(())
}
