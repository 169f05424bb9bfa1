//! CLI command implementations
//!
//! Business logic for the `analyze` and `metadata` subcommands, extracted
//! from main.rs for testability. Snapshot fetching is blocking and runs on
//! a blocking task; the analysis pipeline itself is async.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::analyze::AnalyzedModel;
use crate::error::{MedirError, Result};
use crate::hf::{HubClient, RepoRef};
use crate::pipeline::{self, Cancellation, PipelineConfig};
use crate::report;
use crate::safetensors::{Dtype, SafetensorsFile};

/// Arguments of the `analyze` subcommand.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// `OWNER/REPO` to analyze
    pub hf_repo: String,
    /// Hub token; `HF_TOKEN` is the fallback
    pub hf_token: Option<String>,
    /// Glob selecting repository files
    pub hf_glob: String,
    /// Regular expression selecting tensors by name
    pub filter: String,
    /// Optional path for the persisted analysis document
    pub json: Option<PathBuf>,
}

/// Run the `analyze` subcommand: fetch the snapshot, drive the pipeline,
/// print per-tensor lines and the rollup, optionally persist the document.
///
/// # Errors
///
/// Propagates configuration, fetch, pipeline and serialization failures;
/// [`MedirError::Cancelled`] when interrupted.
pub async fn cmd_analyze(opts: AnalyzeOptions, cancel: Cancellation) -> Result<()> {
    let repo: RepoRef = opts.hf_repo.parse()?;
    let filter = Regex::new(&opts.filter).map_err(|e| MedirError::Config {
        message: format!("invalid tensor filter '{}': {e}", opts.filter),
    })?;

    let files = fetch_snapshot(repo, opts.hf_token, opts.hf_glob).await?;
    if cancel.is_cancelled() {
        return Err(MedirError::Cancelled);
    }

    let model = pipeline::analyze_files(
        files,
        filter,
        PipelineConfig::from_system(),
        cancel,
        |path, tensors| {
            // Lines print as each file completes; cross-file order is
            // whatever the workers produce.
            let (name_width, size_width) = report::column_widths(tensors);
            println!("Processing {}:", base_name(path));
            for t in tensors {
                println!("{}", report::tensor_line(t, name_width, size_width));
            }
        },
    )
    .await?;

    println!("{}", report::model_summary(&model));

    if let Some(path) = opts.json {
        write_document(&model, &path)?;
    }
    Ok(())
}

/// Arguments of the `metadata` subcommand.
#[derive(Debug, Clone)]
pub struct MetadataOptions {
    /// Local archive to inspect instead of a repository
    pub name: Option<PathBuf>,
    /// `OWNER/REPO` to inspect
    pub hf_repo: Option<String>,
    /// Hub token; `HF_TOKEN` is the fallback
    pub hf_token: Option<String>,
    /// Glob selecting repository files
    pub hf_glob: String,
}

/// Run the `metadata` subcommand: print each file's tensor-type histogram
/// and key/value metadata.
///
/// # Errors
///
/// Propagates configuration, fetch and archive failures;
/// [`MedirError::Cancelled`] when interrupted.
pub async fn cmd_metadata(opts: MetadataOptions, cancel: Cancellation) -> Result<()> {
    let files = match (opts.name, opts.hf_repo) {
        (Some(name), _) => vec![name],
        (None, Some(repo)) => {
            let repo: RepoRef = repo.parse()?;
            fetch_snapshot(repo, opts.hf_token, opts.hf_glob).await?
        }
        (None, None) => {
            return Err(MedirError::Config {
                message: "either --name or --hf-repo is required".to_string(),
            })
        }
    };

    for f in files {
        if cancel.is_cancelled() {
            return Err(MedirError::Cancelled);
        }
        let st = SafetensorsFile::open(&f)?;
        println!("{}:", base_name(&f));
        let mut types: BTreeMap<Dtype, usize> = BTreeMap::new();
        for t in st.tensors() {
            *types.entry(t.dtype).or_default() += 1;
        }
        for (dtype, count) in &types {
            println!("  {count} tensors of type {dtype}");
        }
        for (k, v) in st.metadata() {
            println!("- {k}: {v}");
        }
    }
    Ok(())
}

/// Resolve a repository to local files on a blocking task.
async fn fetch_snapshot(
    repo: RepoRef,
    token: Option<String>,
    glob: String,
) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let hub = HubClient::new(token)?;
        hub.ensure_snapshot(&repo, &glob)
    })
    .await
    .map_err(|e| MedirError::Io {
        message: format!("snapshot task failed: {e}"),
    })?
}

/// Serialize the analysis document to `path`.
fn write_document(model: &AnalyzedModel, path: &Path) -> Result<()> {
    let data = serde_json::to_vec(model).map_err(|e| MedirError::Json {
        message: e.to_string(),
    })?;
    std::fs::write(path, data).map_err(MedirError::io)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
