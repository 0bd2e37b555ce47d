//! Atomic JSON persistence helper shared by every subsystem that owns a
//! file under `data_dir` (spec.md §5/§6/§7: "writes are atomic via
//! temp-file + rename", "single-writer per file").
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CoreError, CoreResult};

/// Write `value` to `path` as pretty JSON via a temp-file-then-rename, so a
/// crash mid-write never leaves a half-written file behind. Stable field
/// ordering (serde derives preserve struct-declaration order) keeps the
/// save -> reload -> save round-trip byte-identical, per spec.md §8.
pub async fn save_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> CoreResult<()> {
    let detail_of = |e: std::io::Error| e.to_string();
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CoreError::Persistence {
                file: path.display().to_string(),
                detail: detail_of(e),
            })?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| CoreError::Persistence {
        file: path.display().to_string(),
        detail: e.to_string(),
    })?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &body)
        .await
        .map_err(|e| CoreError::Persistence {
            file: path.display().to_string(),
            detail: detail_of(e),
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CoreError::Persistence {
            file: path.display().to_string(),
            detail: detail_of(e),
        })?;
    Ok(())
}

/// Load and deserialize `path`, returning `Ok(None)` when it doesn't exist
/// yet (fresh install) rather than treating that as a persistence failure.
pub async fn load_if_present<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| CoreError::Persistence {
                file: path.display().to_string(),
                detail: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Persistence {
            file: path.display().to_string(),
            detail: e.to_string(),
        }),
    }
}
