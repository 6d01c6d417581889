use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use org_tasks::core::{Headline, Keyword, Priority};
use org_tasks::{Document, SyntaxError, parse};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "org-tasks",
    about = "Parse org-style task outlines",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print their document trees.
    Parse(ParseArgs),

    /// Report the first syntax error of each Org file.
    Check(CheckArgs),

    /// List task headlines, optionally filtered.
    Tasks(TasksArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Org files or directories containing Org files to check.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct TasksArgs {
    /// Org files or directories containing Org files to scan.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Only headlines with this keyword (TODO, INPROGRESS, DONE, KILL).
    #[arg(long)]
    keyword: Option<Keyword>,
    /// Only headlines with this priority (A, B, C).
    #[arg(long)]
    priority: Option<Priority>,
    /// Only headlines carrying this tag.
    #[arg(long)]
    tag: Option<String>,
    /// Emit JSON instead of one line per task.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args).map(|()| ExitCode::SUCCESS),
        Commands::Check(args) => handle_check(args),
        Commands::Tasks(args) => handle_tasks(args).map(|()| ExitCode::SUCCESS),
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
}

fn load_document(path: &Path) -> Result<Document> {
    let text = read_source(path)?;
    parse(&text).with_context(|| format!("parsing {:?}", path))
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        debug!(path = %path.display(), "parsing");
        let doc = load_document(&path)?;
        parsed.push((path, doc));
    }

    if json {
        #[derive(Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_check(args: CheckArgs) -> Result<ExitCode> {
    let expanded = expand_inputs(&args.inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut failures = 0usize;
    for path in &expanded {
        let text = read_source(path)?;
        if let Err(err) = parse(&text) {
            failures += 1;
            println!("{}", check_report(path, &err));
        }
    }
    info!(files = expanded.len(), failures, "check finished");

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `path:line:column: message`, the shape editors jump to.
fn check_report(path: &Path, err: &SyntaxError) -> String {
    format!("{}:{}:{}: {}", path.display(), err.line, err.column, err.kind)
}

#[derive(Debug, Serialize)]
struct TaskEntry<'a> {
    path: String,
    line: usize,
    headline: &'a Headline,
}

fn handle_tasks(args: TasksArgs) -> Result<()> {
    let TasksArgs {
        inputs,
        keyword,
        priority,
        tag,
        json,
    } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut sources = Vec::new();
    for path in expanded {
        let text = read_source(&path)?;
        let doc = parse(&text).with_context(|| format!("parsing {:?}", path))?;
        sources.push((path, text, doc));
    }

    let mut entries = Vec::new();
    for (path, text, doc) in &sources {
        for h in select_tasks(doc, keyword, priority, tag.as_deref()) {
            entries.push(TaskEntry {
                path: path.display().to_string(),
                line: line_of(text, h.range.start),
                headline: h,
            });
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{}", task_line(entry));
        }
    }
    Ok(())
}

fn select_tasks<'d>(
    doc: &'d Document,
    keyword: Option<Keyword>,
    priority: Option<Priority>,
    tag: Option<&'d str>,
) -> impl Iterator<Item = &'d Headline> {
    doc.headlines()
        .filter(move |h| keyword.is_none_or(|k| h.keyword == k))
        .filter(move |h| priority.is_none_or(|p| h.priority == Some(p)))
        .filter(move |h| tag.is_none_or(|t| h.has_tag(t)))
}

fn task_line(entry: &TaskEntry<'_>) -> String {
    let h = entry.headline;
    let priority = h
        .priority
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let tags = h.tags.as_deref().map(|t| t.join(",")).unwrap_or_default();
    format!(
        "{}:{}\t{}\t{}\t{}\t{}",
        entry.path, entry.line, h.keyword, priority, h.title, tags
    )
}

/// 1-based line containing byte `offset`.
fn line_of(text: &str, offset: usize) -> usize {
    text.as_bytes()[..offset.min(text.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
        + 1
}

/* ---------------------------- Input expansion ---------------------------- */

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = %canonical.display(), "scanning directory");
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if is_org_file(&canonical) {
                debug!(file = %canonical.display(), "adding file");
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            } else {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
        }
    }
    Ok(out)
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        debug!(dir = %canonical.display(), "visiting directory");
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org_file(&canonical) {
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_inputs_walks_directories_and_dedups() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("nested");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(root.join("b.org"), "* TODO b\n").expect("write b");
        fs::write(nested.join("a.org"), "* TODO a\n").expect("write a");
        fs::write(root.join("notes.txt"), "ignored").expect("write txt");

        let expanded =
            expand_inputs(&[root.to_path_buf(), root.join("b.org")]).expect("expand inputs");

        let names: Vec<_> = expanded
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.org", "a.org"]);
    }

    #[test]
    fn expand_inputs_rejects_non_org_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let txt = tmp.path().join("notes.txt");
        fs::write(&txt, "hi").expect("write txt");

        let err = expand_inputs(&[txt]).unwrap_err();
        assert!(err.to_string().contains("is not an .org file"));
    }

    #[test]
    fn load_document_adds_path_context() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bad = tmp.path().join("bad.org");
        fs::write(&bad, "** Hello\n").expect("write bad");

        let err = load_document(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("missing a task keyword"));
        assert!(err.to_string().contains("bad.org"));
    }

    #[test]
    fn check_report_is_editor_friendly() {
        let err = parse("* TODO a\n:PROPERTIES:\n").unwrap_err();
        let report = check_report(Path::new("inbox.org"), &err);
        assert_eq!(
            report,
            "inbox.org:2:1: properties drawer is missing its :END: line"
        );
    }

    #[test]
    fn tasks_are_filtered_by_keyword_and_tag() {
        let text = "* TODO a :x:\n* DONE b :x:\n# c\n* TODO c :y:\n";
        let doc = parse(text).expect("parse");

        let todo: Vec<_> = select_tasks(&doc, Some(Keyword::Todo), None, None)
            .map(|h| h.title.as_str())
            .collect();
        assert_eq!(todo, vec!["a", "c"]);

        let tagged: Vec<_> = select_tasks(&doc, None, None, Some("x"))
            .map(|h| h.title.as_str())
            .collect();
        assert_eq!(tagged, vec!["a", "b"]);

        let c = select_tasks(&doc, Some(Keyword::Todo), None, Some("y"))
            .next()
            .expect("task c");
        let entry = TaskEntry {
            path: "f.org".into(),
            line: line_of(text, c.range.start),
            headline: c,
        };
        assert_eq!(task_line(&entry), "f.org:4\tTODO\t-\tc\ty");
    }

    #[test]
    fn tasks_are_filtered_by_priority() {
        let text = "* [#A] TODO a\n* [#B] TODO b\n* TODO c\n* [#A] DONE d\n";
        let doc = parse(text).expect("parse");

        let urgent: Vec<_> = select_tasks(&doc, None, Some(Priority::A), None)
            .map(|h| h.title.as_str())
            .collect();
        assert_eq!(urgent, vec!["a", "d"]);

        let priority = Cli::try_parse_from(["org-tasks", "tasks", "x.org", "--priority", "B"])
            .map(|cli| match cli.command {
                Commands::Tasks(args) => args.priority,
                _ => None,
            })
            .expect("cli parses");
        assert_eq!(priority, Some(Priority::B));

        let err = Cli::try_parse_from(["org-tasks", "tasks", "x.org", "--priority", "Z"])
            .unwrap_err();
        assert!(err.to_string().contains("unknown priority"));
    }

    #[test]
    fn line_of_counts_newlines() {
        assert_eq!(line_of("a\nb\nc", 0), 1);
        assert_eq!(line_of("a\nb\nc", 2), 2);
        assert_eq!(line_of("a\nb\nc", 99), 3);
    }
}
