use std::io;
use std::path::{Path, PathBuf};

/// List the executables in `dir`, sorted by file name.
///
/// Only regular files (after following symlinks) with at least one execute
/// bit set qualify. Hidden files are skipped.
pub fn scan_worker_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        // A dangling symlink is not a worker; skip rather than fail the scan.
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        if meta.is_file() && is_executable(&meta) {
            found.push(path);
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Create `dir` (and parents) with mode 0755 if it does not exist yet.
pub(crate) fn ensure_worker_dir(dir: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)
}
