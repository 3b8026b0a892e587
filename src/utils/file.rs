use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tempfile::NamedTempFile;


/// Builds a path from a base name with optional directory, prefix and suffix.
///
/// # Arguments
///
/// * `base` - Base file name or path; only its file name is kept when `dir` is given.
/// * `dir` - Optional directory to place the file in.
/// * `prefix` - Optional prefix joined with `delimiter`.
/// * `suffix` - Optional suffix joined with `delimiter`.
/// * `delimiter` - String placed between prefix, base and suffix.
///
/// # Returns
/// PathBuf
pub fn file_path_manipulator(
    base: &Path,
    dir: Option<&Path>,
    prefix: Option<&str>,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut new_name = String::new();
    if let Some(p) = prefix {
        new_name.push_str(p);
        new_name.push_str(delimiter);
    }
    new_name.push_str(&name);
    if let Some(s) = suffix {
        new_name.push_str(delimiter);
        new_name.push_str(s);
    }

    match dir {
        Some(d) => d.join(new_name),
        None => match base.parent() {
            Some(parent) => parent.join(new_name),
            None => PathBuf::from(new_name),
        },
    }
}


/// Writes `contents` to `path` so readers never observe a partial file:
/// the bytes go to a temp file in the same directory, which is then renamed over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {:?}", path))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| anyhow!("Failed to persist {:?}: {}", path, e.error))?;
    Ok(())
}


/// Copies `src` into `dest_dir`, keeping the file name. Creates `dest_dir` when needed.
///
/// # Returns
/// Path of the copy.
pub async fn copy_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("No file name in {:?}", src))?;
    tokio::fs::create_dir_all(dest_dir).await?;
    let dest = dest_dir.join(name);
    tokio::fs::copy(src, &dest)
        .await
        .map_err(|e| anyhow!("Failed to copy {:?} to {:?}: {}", src, dest, e))?;
    Ok(dest)
}


/// Removes a file if present. Missing files are not an error.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("Failed to remove {:?}: {}", path, e)),
    }
}
