//! Platform dependency probe.
//!
//! Answers "why does rendering not work on this machine" before the user
//! finds out mid-batch: reports OS/arch plus the status of every runtime
//! dependency the engine can degrade without (pdfium) or cannot run
//! without (writable temp and data directories, bundled SQLite).

use crate::events::{DependencyReport, DependencyStatus};
use crate::render::raster;
use std::path::Path;

/// Probe the platform and every runtime dependency.
///
/// pdfium binding is attempted for real — the result is exactly what the
/// renderer's primary backend will see.
pub fn check_system_dependencies(data_dir: &Path, temp_dir: &Path) -> DependencyReport {
    let mut dependencies = Vec::new();

    match raster::bind_pdfium() {
        Ok(_) => dependencies.push(DependencyStatus {
            name: "pdfium".into(),
            installed: true,
            version: None,
            required: false,
            description: "PDF rasterisation library (primary render backend)".into(),
            error: None,
        }),
        Err(e) => dependencies.push(DependencyStatus {
            name: "pdfium".into(),
            installed: false,
            version: None,
            required: false,
            description: "PDF rasterisation library (primary render backend); \
                          pages fall back to placeholder rendering without it"
                .into(),
            error: Some(e),
        }),
    }

    dependencies.push(dir_status(
        "temp-dir",
        temp_dir,
        "scratch directory for rendered page images",
    ));
    dependencies.push(dir_status(
        "data-dir",
        data_dir,
        "cache and history storage directory",
    ));

    dependencies.push(DependencyStatus {
        name: "sqlite".into(),
        installed: true,
        version: Some(rusqlite::version().to_string()),
        required: true,
        description: "bundled SQLite (cache and history stores)".into(),
        error: None,
    });

    DependencyReport {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        dependencies,
    }
}

fn dir_status(name: &str, dir: &Path, description: &str) -> DependencyStatus {
    let error = probe_writable(dir).err();
    DependencyStatus {
        name: name.into(),
        installed: error.is_none(),
        version: None,
        required: true,
        description: description.into(),
        error,
    }
}

fn probe_writable(dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
    let probe = dir.join(".write-probe");
    std::fs::write(&probe, b"ok").map_err(|e| format!("write {}: {e}", probe.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
