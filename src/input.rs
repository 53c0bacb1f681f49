#![forbid(unsafe_code)]

//! Turns user input into an ordered list of candidate URLs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::{FetchError, FetchResult};

/// Accepts either comma-separated text or the contents of a URL list file
/// (one per line), never both. Entries are trimmed and blanks dropped; order
/// and duplicates are preserved for the orchestrator to deal with.
pub fn normalize_urls(text: Option<&str>, file_contents: Option<&str>) -> FetchResult<Vec<String>> {
    let text = text.filter(|text| !text.trim().is_empty());
    match (text, file_contents) {
        (Some(_), Some(_)) => Err(FetchError::invalid_input(
            "enter URLs as text or from a file, not both",
        )),
        (Some(text), None) => Ok(split_entries(text.split([',', '\n']))),
        (None, Some(contents)) => Ok(split_entries(contents.lines())),
        (None, None) => Ok(Vec::new()),
    }
}

fn split_entries<'a>(parts: impl Iterator<Item = &'a str>) -> Vec<String> {
    parts
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn collect_urls(text: Option<&str>, file: Option<&Path>) -> Result<Vec<String>> {
    let contents = file
        .map(|path| {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        })
        .transpose()?;
    Ok(normalize_urls(text, contents.as_deref())?)
}
