//! ingot-map: Map nested JSON into relational tables with a mapping document
//!
//! Usage:
//!   # Read from file, output to stdout
//!   ingot-map --mapping blog.json data.json
//!
//!   # Read NDJSON from stdin, write one .jsonl file per table
//!   cat events.jsonl | ingot-map --mapping events.json --ndjson --output-dir ./tables
//!
//!   # Stop at the first builder or merge error
//!   ingot-map --mapping blog.json --fail-fast data.json

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ingot::{
    bind_many_to_one, compute_relationship_keys, run_mapping_many, ErrorMode, MappingDocument, RunConfig,
    SingleWriter, TableWriter,
};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingot-map")]
#[command(about = "Map nested JSON into relational tables", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Mapping document describing traversals, emissions and relationships
    #[arg(long, short = 'm')]
    mapping: String,

    /// Process newline-delimited JSON (one root per line)
    #[arg(long)]
    ndjson: bool,

    /// Treat a top-level array as a single root instead of a stream of roots
    #[arg(long)]
    no_split_array: bool,

    /// Output directory for separate .jsonl files per table
    /// If omitted, writes to stdout as a single stream with `_table` and `_key`
    #[arg(long, short = 'o')]
    output_dir: Option<String>,

    /// Abort on the first builder or merge error instead of collecting them
    #[arg(long)]
    fail_fast: bool,

    /// Field injected into rows keyed by a single component (default: "id")
    #[arg(long)]
    id_field: Option<String>,

    /// Log progress to stderr
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "ingot=debug" } else { "ingot=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let text = std::fs::read_to_string(&args.mapping)
        .with_context(|| format!("Failed to read mapping: {}", args.mapping))?;
    let (spec, relationships) = MappingDocument::from_json(&text)?.compile()?;

    let mut config = RunConfig::default();
    if args.fail_fast {
        config.error_mode = ErrorMode::FailFast;
    }
    if let Some(field) = args.id_field {
        config.id_field = field;
    }

    let reader = if let Some(file_path) = &args.input {
        Box::new(BufReader::new(File::open(file_path)?)) as Box<dyn Read>
    } else {
        Box::new(std::io::stdin()) as Box<dyn Read>
    };
    let roots = read_roots(reader, args.ndjson, !args.no_split_array)?;
    info!(roots = roots.len(), tables = spec.tables().len(), "mapping input");

    let mut result = run_mapping_many(&roots, &spec, &config)?;
    let key_maps = compute_relationship_keys(&roots, &spec, &relationships);
    bind_many_to_one(&mut result, &relationships, &key_maps, &config.id_field)?;

    if let Some(output_dir) = &args.output_dir {
        let mut writer = TableWriter::new(output_dir)?;
        writer.write_result(&result)?;
        writer.flush()?;
    } else {
        let mut writer = SingleWriter::new(std::io::stdout().lock());
        writer.write_result(&result)?;
        writer.flush()?;
    }

    if !result.errors.is_empty() {
        for err in result.errors.iter() {
            error!("{}", err);
        }
        bail!("{} record(s) failed", result.errors.len());
    }
    Ok(())
}

/// Read every root from the input using SIMD-accelerated parsing when possible
fn read_roots(reader: Box<dyn Read>, ndjson: bool, split_array: bool) -> Result<Vec<Value>> {
    let mut content = Vec::new();
    let mut buf_reader = BufReader::new(reader);
    buf_reader.read_to_end(&mut content)?;

    if !ndjson {
        let mut scratch = content.clone();
        match simd_json::serde::from_slice::<Value>(&mut scratch) {
            Ok(Value::Array(items)) if split_array => return Ok(items),
            Ok(value) => return Ok(vec![value]),
            Err(err) => debug!(error = %err, "simd parse failed, falling back to a JSON stream"),
        }
    }

    // Fallback for NDJSON or concatenated documents
    let stream = serde_json::Deserializer::from_slice(&content).into_iter::<Value>();
    let mut roots = Vec::new();
    for value in stream {
        roots.push(value.context("Failed to parse JSON")?);
    }
    Ok(roots)
}
