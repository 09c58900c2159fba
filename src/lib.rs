#[cfg(all(not(target_arch = "wasm32"), feature = "python"))]
use pyo3::prelude::*;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod allowlist;
pub mod archive;
pub mod ast;
pub mod atl;
pub mod container;
pub mod error;
pub mod loader;
pub mod pickle;
pub mod screen;
pub mod translate;
pub mod types;
pub mod unparser;
pub mod value;

#[cfg(test)]
mod testutil;

use crate::allowlist::AllowList;
use crate::ast::Node;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use error::{Error, Result};
pub use types::{BatchReport, Metadata};
pub use unparser::{UnparseOptions, Unparser};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompileOptions {
    /// Read the statements as they were before the translation pass.
    pub pre_translated: bool,
    /// Explicit slot preference; overrides `pre_translated` when non-empty.
    pub slots: Vec<u32>,
    pub indent: usize,
    /// Batch runs replace existing `.rpy` files only when set.
    pub overwrite: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            pre_translated: false,
            slots: Vec::new(),
            indent: UnparseOptions::default().indent,
            overwrite: true,
        }
    }
}

impl DecompileOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn slot_preference(&self) -> Vec<u32> {
        if !self.slots.is_empty() {
            self.slots.clone()
        } else if self.pre_translated {
            container::PRE_TRANSLATED_SLOTS.to_vec()
        } else {
            container::DEFAULT_SLOTS.to_vec()
        }
    }

    fn unparser(&self) -> Unparser {
        Unparser::with_options(UnparseOptions {
            indent: self.indent,
        })
    }
}

/// Whether `path` names a compiled script (`.rpyc` or `.rpymc`).
pub fn is_compiled_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("rpyc" | "rpymc")
    )
}

/// `script.rpyc` becomes `script.rpy`, `lib.rpymc` becomes `lib.rpym`.
pub fn source_path(compiled: &Path) -> PathBuf {
    match compiled.extension().and_then(|e| e.to_str()) {
        Some("rpyc") => compiled.with_extension("rpy"),
        Some("rpymc") => compiled.with_extension("rpym"),
        _ => compiled.with_extension("rpy"),
    }
}

/// Reads the statement tree and payload metadata out of a compiled file.
pub fn load_bytes(bytes: &[u8], options: &DecompileOptions) -> Result<(Metadata, Vec<Node>)> {
    let payload = container::read_slot(bytes, &options.slot_preference())?;
    let (metadata, root) = pickle::deserialize(&payload.data, &AllowList::default())?;
    let statements = loader::load_statements(&root)?;
    tracing::debug!(
        slot = payload.slot,
        statements = statements.len(),
        "loaded compiled script"
    );
    Ok((metadata, statements))
}

pub fn decompile_bytes(bytes: &[u8], options: &DecompileOptions) -> Result<String> {
    let (_, statements) = load_bytes(bytes, options)?;
    let mut text = options.unparser().render_file(&statements)?;
    text.push('\n');
    Ok(text)
}

/// Decompiles one file next to itself and returns the written path.
pub fn decompile_file(path: &Path, options: &DecompileOptions) -> Result<PathBuf> {
    let bytes = std::fs::read(path)?;
    let text = decompile_bytes(&bytes, options)?;
    let out = source_path(path);
    std::fs::write(&out, text)?;
    tracing::info!(input = %path.display(), output = %out.display(), "decompiled");
    Ok(out)
}

/// The metadata and statement tree as pretty-printed JSON.
pub fn dump_json(bytes: &[u8], options: &DecompileOptions) -> Result<String> {
    #[derive(Serialize)]
    struct Dump<'a> {
        metadata: &'a Metadata,
        statements: &'a [Node],
    }
    let (metadata, statements) = load_bytes(bytes, options)?;
    Ok(serde_json::to_string_pretty(&Dump {
        metadata: &metadata,
        statements: &statements,
    })?)
}

/// Decompiles every compiled script under `dir` in parallel. Failures,
/// including unreadable directory entries, are logged and reported; once
/// `cancel` is set no further file is started.
/// Without `overwrite`, files whose output already exists are skipped.
#[cfg(not(target_arch = "wasm32"))]
pub fn decompile_dir(
    dir: &Path,
    options: &DecompileOptions,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<BatchReport> {
    use rayon::prelude::*;
    use std::sync::atomic::Ordering;
    use walkdir::WalkDir;

    enum Outcome {
        Done(PathBuf),
        Failed(PathBuf, String),
        Skipped(PathBuf),
    }

    let mut report = BatchReport::default();
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && is_compiled_script(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            Err(e) => {
                let path = e.path().unwrap_or(dir).to_path_buf();
                tracing::error!(path = %path.display(), error = %e, "cannot read directory entry");
                report.failed.push(types::FailedFile {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }
    files.sort();

    let outcomes: Vec<Outcome> = files
        .into_par_iter()
        .map(|path| {
            if cancel.load(Ordering::Relaxed) {
                return Outcome::Skipped(path);
            }
            if !options.overwrite && source_path(&path).exists() {
                tracing::debug!(file = %path.display(), "output exists, skipping");
                return Outcome::Skipped(path);
            }
            match decompile_file(&path, options) {
                Ok(_) => Outcome::Done(path),
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "decompile failed");
                    Outcome::Failed(path, e.to_string())
                }
            }
        })
        .collect();

    for outcome in outcomes {
        match outcome {
            Outcome::Done(path) => report.decompiled.push(path),
            Outcome::Failed(path, error) => {
                report.failed.push(types::FailedFile { path, error })
            }
            Outcome::Skipped(path) => report.skipped.push(path),
        }
    }
    Ok(report)
}

#[cfg(all(not(target_arch = "wasm32"), feature = "python"))]
#[pyfunction]
#[pyo3(name = "decompile_bytes")]
fn py_decompile_bytes(data: &[u8], pre_translated: Option<bool>) -> PyResult<String> {
    let options = DecompileOptions {
        pre_translated: pre_translated.unwrap_or(false),
        ..DecompileOptions::default()
    };
    decompile_bytes(data, &options)
        .map_err(|e| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(e.to_string()))
}

#[cfg(all(not(target_arch = "wasm32"), feature = "python"))]
#[pymodule]
fn rpycdec(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(py_decompile_bytes, m)?)?;
    Ok(())
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn decompile_bytes_wasm(data: &[u8], options_json: &str) -> std::result::Result<String, JsValue> {
    let options = if options_json.trim().is_empty() {
        DecompileOptions::default()
    } else {
        DecompileOptions::from_json(options_json).map_err(|e| JsValue::from_str(&e.to_string()))?
    };
    decompile_bytes(data, &options).map_err(|e| JsValue::from_str(&e.to_string()))
}
