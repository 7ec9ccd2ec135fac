use crate::error::BootError;
use crate::fsutil::ensure_parent;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const USER_AGENT: &str = concat!("wslboot/", env!("CARGO_PKG_VERSION"));

pub fn temp_download_dir() -> Result<TempDir, BootError> {
    Ok(tempfile::Builder::new()
        .prefix("wslboot-download-")
        .tempdir()?)
}

pub fn download_file(url: &str, path: &Path) -> Result<(), BootError> {
    let client = reqwest::blocking::Client::new();
    let response = client.get(url).header("User-Agent", USER_AGENT).send()?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(BootError::Process(format!(
            "download failed: {} (HTTP {} {})",
            url, status, body
        )));
    }
    let bytes = response.bytes()?;
    ensure_parent(path)?;
    fs::write(path, &bytes)?;
    Ok(())
}

pub fn installer_file_name(url: &str, fallback: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let candidate = without_query.rsplit('/').next().unwrap_or_default();
    let lower = candidate.to_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".msi") {
        candidate.to_string()
    } else {
        fallback.to_string()
    }
}

pub fn with_downloaded_installer<F>(url: &str, fallback_name: &str, install: F) -> Result<(), BootError>
where
    F: FnOnce(&Path) -> Result<(), BootError>,
{
    let dir = temp_download_dir()?;
    let dir_path = dir.path().to_path_buf();
    let path = dir_path.join(installer_file_name(url, fallback_name));
    tracing::info!(%url, path = %path.display(), "downloading installer");
    let result = download_file(url, &path).and_then(|_| install(&path));
    if let Err(err) = dir.close() {
        tracing::debug!(dir = %dir_path.display(), error = %err, "failed to remove download dir");
    }
    result
}
