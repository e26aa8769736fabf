use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indexmap::IndexMap;
use taskline::core::is_complete_status;
use taskline::parser::task_marker;
use taskline::{
    Annotation, Change, Dialect, LineBuffer, MarkdownTaskSource, Origin, ParentCompletion,
    Settings, Task, TaskSource, Transaction,
};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(
    name = "taskline",
    about = "Markdown task tooling built on the taskline crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Markdown files and print their tasks.
    Parse(ParseArgs),

    /// Set the status of one task and propagate it to the parent.
    Toggle(ToggleArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown files or directories containing Markdown files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Metadata notation tried first. Overrides the settings file.
    #[arg(long, value_enum)]
    dialect: Option<DialectArg>,
    /// JSON settings file.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Emit JSON instead of one line per task.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    /// Markdown file to edit.
    file: PathBuf,
    /// 1-based line number of the task.
    #[arg(long)]
    line: usize,
    /// New status character. Defaults to flipping between done and open.
    #[arg(long)]
    status: Option<char>,
    /// JSON settings file.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DialectArg {
    Symbols,
    Fields,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Symbols => Dialect::Symbols,
            DialectArg::Fields => Dialect::Fields,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Toggle(args) => handle_toggle(args),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        "taskline=debug,info"
    } else {
        "taskline=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Ok(Settings::load(path)?),
        None => Ok(Settings::default()),
    }
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs {
        inputs,
        dialect,
        settings,
        json,
    } = args;
    let settings = load_settings(settings.as_deref())?;
    let dialect = dialect.map(Dialect::from).unwrap_or(settings.dialect);

    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Markdown files found in the provided inputs");
    }

    let source = MarkdownTaskSource { dialect };
    let mut parsed: IndexMap<String, Vec<Task>> = IndexMap::new();
    for path in expanded {
        debug!("parsing {:?}", path);
        let tasks = source
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.insert(path.display().to_string(), tasks);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
    } else {
        for (idx, (path, tasks)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path);
            }
            for task in tasks {
                println!("{}", render_task_line(task));
            }
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_toggle(args: ToggleArgs) -> Result<()> {
    let ToggleArgs {
        file,
        line,
        status,
        settings,
        in_place,
    } = args;
    let settings = load_settings(settings.as_deref())?;
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let before = LineBuffer::new(text);
    let after = toggle_status(&before, line, status, &settings)?;

    if in_place {
        fs::write(&file, after.text().as_bytes())
            .with_context(|| format!("writing {:?}", file))?;
    } else {
        print!("{}", after.text());
        if !after.text().ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

/// Apply a status edit to `line` as a user transaction, letting parent completion
/// amend it before it is committed.
fn toggle_status(
    before: &LineBuffer,
    line: usize,
    status: Option<char>,
    settings: &Settings,
) -> Result<LineBuffer> {
    let target = before.line(line).with_context(|| {
        format!(
            "line {line} is out of range (document has {} lines)",
            before.line_count()
        )
    })?;
    let Some(marker) = task_marker(target.text) else {
        anyhow::bail!("line {line} is not a task: {:?}", target.text);
    };
    let next = status.unwrap_or(if is_complete_status(marker.status) {
        ' '
    } else {
        'x'
    });

    let range = target.from + marker.status_offset..target.from + marker.close_bracket();
    let tr = Transaction::from_changes(vec![Change::replace(range, next.to_string())], Origin::Input)?
        .with_annotation(Annotation::StatusCycle);
    let after = tr.apply(before)?;

    let engine = ParentCompletion::new(settings.propagation.clone());
    let tr = engine.intercept(tr, before, &after);
    if let Some(stage) = tr.propagation_stage() {
        info!(line, %stage, "parent status updated");
    }
    Ok(tr.apply(before)?)
}

fn render_task_line(task: &Task) -> String {
    let mut out = format!(
        "{:>6} [{}] {}",
        format!("L{}", task.line),
        task.status,
        task.content
    );
    let dates = [
        ("start", task.start_date),
        ("scheduled", task.scheduled_date),
        ("due", task.due_date),
        ("done", task.completed_date),
        ("created", task.created_date),
    ];
    for (label, date) in dates {
        if let Some(date) = date {
            out.push_str(&format!(" {label}:{date}"));
        }
    }
    if let Some(priority) = task.priority {
        out.push_str(&format!(" priority:{priority}"));
    }
    if let Some(rule) = &task.recurrence {
        out.push_str(&format!(" repeat:{rule:?}"));
    }
    if let Some(project) = &task.project {
        out.push_str(&format!(" project:{project}"));
    }
    if let Some(context) = &task.context {
        out.push_str(&format!(" @{context}"));
    }
    for tag in &task.tags {
        out.push(' ');
        out.push_str(&tag.0);
    }
    out
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("scanning directory {:?}", canonical);
            for file in collect_markdown_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if is_markdown(&canonical) {
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            } else {
                anyhow::bail!("{:?} is not a Markdown file", canonical);
            }
        }
    }
    Ok(out)
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

fn collect_markdown_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(root, &mut out, &mut visited)?;
    out.sort();
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
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        debug!("found Markdown file {:?}", canonical);
        out.push(canonical);
    }
    Ok(())
}
