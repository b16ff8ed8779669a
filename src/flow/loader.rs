use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use super::FlowDraft;

#[derive(Debug, Error)]
pub enum FlowFileError {
    #[error("could not read {path}: {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("could not parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("unsupported extension on {0} (expected .yaml or .yml)")]
    UnsupportedExtension(PathBuf),
}

/// True for `*.yaml` / `*.yml` files, which covers `*.flow.yaml`.
pub fn is_flow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

pub fn load_flow_file(path: &Path) -> Result<FlowDraft, FlowFileError> {
    if !is_flow_file(path) {
        return Err(FlowFileError::UnsupportedExtension(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path).map_err(|e| FlowFileError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_yaml_bw::from_str(&contents).map_err(|e| FlowFileError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn save_flow_file(path: &Path, draft: &FlowDraft) -> Result<(), FlowFileError> {
    let contents = serde_yaml_bw::to_string(draft).map_err(|e| FlowFileError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, contents).map_err(|e| FlowFileError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Load every flow file in `dir`, sorted by file name. Unreadable files are
/// logged and left out.
pub fn load_flow_dir(dir: &Path) -> Result<Vec<(PathBuf, FlowDraft)>, FlowFileError> {
    let entries = fs::read_dir(dir).map_err(|e| FlowFileError::Io {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_flow_file(p))
        .collect();
    paths.sort();

    let mut drafts = Vec::with_capacity(paths.len());
    for path in paths {
        match load_flow_file(&path) {
            Ok(draft) => {
                info!("Loaded flow `{}` from {}", draft.name, path.display());
                drafts.push((path, draft));
            }
            Err(e) => warn!("Skipping flow file: {e}"),
        }
    }
    Ok(drafts)
}
