use crate::format::Format;
use crate::request::Figure;
use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PREFIX: &str = "fig";

static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \-]").unwrap());
static UNSAFE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_]").unwrap());

/// File name prefix derived from the figure title: spaces and dashes become
/// underscores, anything else outside `[A-Za-z0-9_]` is dropped.
pub fn title_prefix(figure: Option<&Figure>) -> String {
    let title = figure.and_then(Figure::title).unwrap_or(DEFAULT_PREFIX);
    let prefix = SEPARATOR_RE.replace_all(title, "_");
    let prefix = UNSAFE_RE.replace_all(&prefix, "");
    if prefix.is_empty() {
        DEFAULT_PREFIX.to_string()
    } else {
        prefix.into_owned()
    }
}

/// First free `prefix.ext`, `prefix-2.ext`, `prefix-3.ext`, ... in `dir`,
/// continuing after the highest number already taken.
pub fn next_filename(dir: &Path, prefix: &str, ext: &str) -> Result<String> {
    let numbered = Regex::new(&format!(
        r"^{}-(\d+)\.{}$",
        regex::escape(prefix),
        regex::escape(ext)
    ))?;

    let mut highest = usize::from(dir.join(format!("{prefix}.{ext}")).exists());
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(n) = numbered
            .captures(name)
            .and_then(|caps| caps[1].parse::<usize>().ok())
        {
            highest = highest.max(n);
        }
    }

    let next = highest + 1;
    Ok(if next == 1 {
        format!("{prefix}.{ext}")
    } else {
        format!("{prefix}-{next}.{ext}")
    })
}

/// Where an export lands. A path with an extension is used as is (its parent
/// must exist); anything else must be an existing directory and gets a
/// title-derived file name.
pub fn resolve_output_path(path: &Path, figure: Option<&Figure>, format: Format) -> Result<PathBuf> {
    if path.extension().is_none() || path.is_dir() {
        if !path.is_dir() {
            bail!("Directory {} not found. Please create it.", path.display());
        }
        let name = next_filename(path, &title_prefix(figure), format.as_str())?;
        return Ok(path.join(name));
    }

    let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    if let Some(parent) = parent.filter(|parent| !parent.is_dir()) {
        bail!(
            "Cannot reach path {}. Are all directories created?",
            parent.display()
        );
    }
    Ok(path.to_path_buf())
}

/// Format implied by an output file extension.
pub fn format_from_path(path: &Path) -> Option<Format> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(Format::from_name)
}
