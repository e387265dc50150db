//! Zip helpers for code archives, input data and output data.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Extract every entry of `archive` into `dest`, creating it if needed.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = ZipArchive::new(file).with_context(|| format!("reading {}", archive.display()))?;
    std::fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    zip.extract(dest)
        .with_context(|| format!("extracting {} into {}", archive.display(), dest.display()))
}

/// Deflate the contents of `dir` into an in-memory zip archive.
/// Entry names are relative to `dir`.
pub fn zip_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    add_tree(&mut writer, dir, dir, options)?;
    Ok(writer.finish().context("finishing zip archive")?.into_inner())
}

fn add_tree(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    root: &Path,
    dir: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            writer.add_directory(format!("{}/", name), options)?;
            add_tree(writer, root, &path, options)?;
        } else if file_type.is_file() {
            writer.start_file(name, options)?;
            let mut contents = Vec::new();
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut contents))
                .with_context(|| format!("reading {}", path.display()))?;
            writer.write_all(&contents)?;
        }
    }
    Ok(())
}

/// True when `dir` exists and has at least one entry.
pub fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Recursive listing of `dir`, one relative path per line. Used in
/// diagnostics when an expected file is missing.
pub fn list_tree(dir: &Path) -> String {
    let mut lines = Vec::new();
    walk(dir, dir, &mut lines);
    lines.sort();
    if lines.is_empty() {
        format!("  ({} is empty or unreadable)", dir.display())
    } else {
        lines.join("\n")
    }
}

fn walk(root: &Path, dir: &Path, lines: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        lines.push(format!(
            "  {}",
            path.strip_prefix(root).unwrap_or(&path).display()
        ));
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            walk(root, &path, lines);
        }
    }
}
