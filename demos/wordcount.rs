//! Split a text file, count words in each part and sum the counts.
//!
//! ```sh
//! echo '{"input_file": "book.txt", "num_splits": 4, "output_dir": "out"}' > wc.json
//! cargo run --example wordcount -- --config wc.json --cleanup
//! ```

use std::fs;
use std::process::ExitCode;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use pipewright::{
    Args, ConfigMap, Registry, RunOptions, Signature, TaskContext, TaskResult, WorkspaceAllocator,
    init_logging, worker,
};
use serde_json::{Value, json};

#[derive(Parser, Debug)]
#[command(version, about = "Split-map-reduce word count on the pipewright engine")]
struct Cli {
    /// Path to the JSON parameter file.
    #[arg(short, long)]
    config: Utf8PathBuf,

    /// Directory holding per-task workspaces.
    #[arg(short, long, default_value = "_pipewright_wordcount")]
    work_dir: Utf8PathBuf,

    /// Number of parallel workers, defaults to the number of CPUs.
    #[arg(short = 'j', long)]
    max_workers: Option<usize>,

    /// Remove the work directory before running.
    #[arg(long)]
    cleanup: bool,

    /// Print the run graph as a Mermaid diagram.
    #[arg(long)]
    mermaid: bool,
}

fn split_file(ctx: &TaskContext) -> TaskResult {
    let input = ctx.path("input_path")?;
    let parts: usize = ctx.input_as("num_splits")?;
    if parts == 0 {
        bail!("num_splits must be positive");
    }

    let text = fs::read_to_string(input).with_context(|| format!("reading {input}"))?;
    let lines: Vec<&str> = text.lines().collect();
    let per_part = lines.len().div_ceil(parts).max(1);

    let mut outputs = Vec::with_capacity(parts);
    for i in 0..parts {
        let chunk = lines.iter().skip(i * per_part).take(per_part);
        let body: String = chunk.map(|line| format!("{line}\n")).collect();
        let path = ctx.workspace().join(format!("split_{:02}.txt", i + 1));
        fs::write(&path, body).with_context(|| format!("writing {path}"))?;
        outputs.push(path);
    }

    Ok(json!(outputs))
}

fn count_words(ctx: &TaskContext) -> TaskResult {
    let files: Vec<Utf8PathBuf> = ctx.input_as("split_files")?;

    let mut counts = Vec::with_capacity(files.len());
    for (i, file) in files.iter().enumerate() {
        let text = fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
        let count = text.split_whitespace().count();
        fs::write(ctx.workspace().join(format!("count_{:02}.txt", i + 1)), count.to_string())?;
        counts.push(count);
    }

    Ok(json!(counts))
}

fn sum_counts(ctx: &TaskContext) -> TaskResult {
    let counts: Vec<u64> = ctx.input_as("counts")?;
    let name: String = ctx.input_as("final_output_filename")?;
    let total: u64 = counts.iter().sum();

    let output_dir = ctx
        .config()
        .get("output_dir")
        .and_then(Value::as_str)
        .context("'output_dir' missing from configuration")?;
    let output_dir = Utf8Path::new(output_dir);
    fs::create_dir_all(output_dir)?;

    let path = output_dir.join(name);
    fs::write(&path, format!("{total}\n")).with_context(|| format!("writing {path}"))?;
    Ok(json!({ "total": total, "path": path }))
}

fn registry() -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    registry.register("split_file", Signature::of(["input_path", "num_splits"]), split_file)?;
    registry.register("count_words", Signature::of(["split_files"]), count_words)?;
    registry.register(
        "sum_counts",
        Signature::new()
            .param("counts")
            .param_or("final_output_filename", "total_count.txt"),
        sum_counts,
    )?;
    Ok(registry)
}

fn load_config(path: &Utf8Path) -> anyhow::Result<ConfigMap> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let value: Value = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    let mut config: serde_json::Map<String, Value> = match value {
        Value::Object(map) => map,
        _ => bail!("{path} must contain a JSON object"),
    };

    // Relative paths are taken relative to the current directory, workers
    // need them absolute.
    let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
    for key in ["input_file", "output_dir"] {
        if let Some(Value::String(rel)) = config.get(key) {
            let abs = cwd.join(rel);
            config.insert(key.to_string(), json!(abs));
        }
    }

    Ok(ConfigMap::try_from(Value::Object(config))?)
}

fn run(registry: &Registry) -> anyhow::Result<bool> {
    let cli = Cli::parse();
    init_logging()?;

    let config = load_config(&cli.config)?;
    let input = config
        .get("input_file")
        .and_then(Value::as_str)
        .context("'input_file' missing from configuration")?
        .to_string();
    let splits = config
        .get("num_splits")
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .context("'num_splits' must be a positive integer")?;

    if cli.cleanup {
        WorkspaceAllocator::new(&cli.work_dir)?.cleanup()?;
    }

    let task = |name: &str| registry.get(name).with_context(|| format!("task {name} missing"));

    let mut pipeline = registry.pipeline();
    let parts = task("split_file")?.call(&mut pipeline, Args::new().arg(input).arg(splits))?;
    let counts = task("count_words")?.call(&mut pipeline, Args::new().arg(parts))?;
    let total = task("sum_counts")?.call(&mut pipeline, Args::new().arg(counts))?;
    let graph = pipeline.finish();

    let mut options = RunOptions::new(cli.work_dir).config(config).target(&total);
    if let Some(n) = cli.max_workers {
        options = options.max_workers(n);
    }

    let report = graph.run(options)?;
    eprintln!("{report}");
    if cli.mermaid {
        println!("{}", report.render_mermaid());
    }

    if let Some(value) = report.value(&total) {
        println!("Total word count: {}", value["total"]);
    }
    for (node, error) in report.errors() {
        tracing::error!(node = %node, "{}\n{}", error, error.trace);
    }

    Ok(report.is_success())
}

fn main() -> ExitCode {
    let registry = match registry() {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("wordcount: {err:?}");
            return ExitCode::from(2);
        }
    };
    worker::enter(&registry);

    match run(&registry) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("wordcount: {err:?}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_every_pipeline_task() {
        let registry = registry().unwrap();
        for name in ["split_file", "count_words", "sum_counts"] {
            assert!(registry.get(name).is_some(), "{name} not registered");
        }
    }
}
