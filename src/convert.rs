//! Kepub conversion through the external `kepubify` tool.

use crate::config::ConversionConfig;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Turns a source file into a device-optimized artifact.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `source` into `output`, returning the path actually written.
    async fn convert(&self, source: &Path, output: &Path) -> Result<PathBuf>;
}

/// Runs `kepubify -o <output> <source>` as a child process.
pub struct KepubConverter {
    binary: PathBuf,
    timeout: Duration,
}

impl KepubConverter {
    /// Create a converter from the conversion settings.
    ///
    /// A bare program name is resolved against `PATH` once, here.
    pub fn new(config: &ConversionConfig) -> Self {
        let binary = resolve_binary(&config.kepubify_path)
            .unwrap_or_else(|| config.kepubify_path.clone());
        Self {
            binary,
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
        }
    }

    /// Binary this converter runs.
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

/// Locate the converter binary: explicit paths must exist, bare names are looked up
/// in `PATH`.
pub fn resolve_binary(configured: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    resolve_in(configured, &path_var)
}

fn resolve_in(configured: &Path, path_var: &OsStr) -> Option<PathBuf> {
    if configured.components().count() > 1 || configured.is_absolute() {
        return configured.is_file().then(|| configured.to_path_buf());
    }
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| {
            let plain = dir.join(configured);
            let exe = (!std::env::consts::EXE_EXTENSION.is_empty())
                .then(|| plain.with_extension(std::env::consts::EXE_EXTENSION));
            std::iter::once(plain).chain(exe)
        })
        .find(|candidate| candidate.is_file())
}

fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((idx, _)) => text[idx..].to_string(),
        None => text.to_string(),
    }
}

#[async_trait]
impl Converter for KepubConverter {
    async fn convert(&self, source: &Path, output: &Path) -> Result<PathBuf> {
        if source == output {
            return Err(AppError::Conversion(
                "source and output are the same file".into(),
            ));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Stale output from an earlier attempt would mask a failed run
        match tokio::fs::remove_file(output).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            binary = %self.binary.display(),
            source = %source.display(),
            output = %output.display(),
            "Running kepubify"
        );

        let child = Command::new(&self.binary)
            .arg("-o")
            .arg(output)
            .arg(source)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Conversion(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) if out.status.success() => {
                if tokio::fs::try_exists(output).await.unwrap_or(false) {
                    Ok(output.to_path_buf())
                } else {
                    Err(AppError::Conversion(
                        "kepubify exited successfully but wrote no output".into(),
                    ))
                }
            }
            Ok(Ok(out)) => Err(AppError::Conversion(format!(
                "kepubify exited with {}: {}",
                out.status,
                tail(&out.stderr, 500)
            ))),
            Ok(Err(e)) => Err(AppError::Conversion(format!("kepubify wait failed: {}", e))),
            Err(_) => Err(AppError::Conversion(format!(
                "kepubify timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(output).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(path = %output.display(), error = %e, "Failed to remove partial kepub");
        }
        result
    }
}

/// Output location for a book's kepub.
pub fn kepub_output_path(kepub_dir: &Path, book_id: &str) -> PathBuf {
    kepub_dir.join(format!("{}.kepub.epub", book_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_is_keyed_by_book() {
        assert_eq!(
            kepub_output_path(Path::new("/data/kepub"), "abc"),
            PathBuf::from("/data/kepub/abc.kepub.epub")
        );
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail(b"  hello world \n", 5), "world");
        assert_eq!(tail(b"short", 50), "short");
    }

    #[test]
    fn bare_name_is_found_on_path() {
        let bin = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("kepubify"), b"#!/bin/sh\n").unwrap();
        let path_var = std::env::join_paths([other.path(), bin.path()]).unwrap();

        assert_eq!(
            resolve_in(Path::new("kepubify"), &path_var),
            Some(bin.path().join("kepubify"))
        );
        assert_eq!(resolve_in(Path::new("kepubify"), OsStr::new("")), None);
    }

    #[test]
    fn explicit_path_is_not_searched() {
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("kepubify"), b"").unwrap();
        let path_var = std::env::join_paths([bin.path()]).unwrap();

        let explicit = bin.path().join("kepubify");
        assert_eq!(resolve_in(&explicit, &path_var), Some(explicit.clone()));
        assert_eq!(
            resolve_in(Path::new("/nonexistent/kepubify"), &path_var),
            None
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.epub");
        std::fs::write(&source, b"not really an epub").unwrap();

        let converter = KepubConverter::new(&ConversionConfig {
            kepubify_path: PathBuf::from("/nonexistent/kepubify"),
            ..Default::default()
        });
        let err = converter
            .convert(&source, &dir.path().join("out/a.kepub.epub"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conversion(_)));
    }
}
