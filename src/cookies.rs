#![forbid(unsafe_code)]

//! Netscape-format cookie jar inspection.
//!
//! The jar is only handed to yt-dlp; this module decides whether it is worth
//! handing over at all by looking at expiry timestamps.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieLine {
    pub domain: String,
    pub name: String,
    /// `None` for session cookies (expiry field `0`).
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CookieJarStatus {
    pub total: usize,
    pub expired: usize,
    pub earliest_expiry: Option<DateTime<Utc>>,
}

impl CookieJarStatus {
    /// At least one cookie that has not expired yet.
    pub fn usable(&self) -> bool {
        self.total > self.expired
    }
}

/// Parses tab-separated cookie lines. Comments, blank lines and rows with
/// fewer than seven fields are skipped.
pub fn parse_cookie_jar(contents: &str) -> Vec<CookieLine> {
    contents
        .lines()
        .filter_map(|raw| {
            let line = raw.strip_prefix(HTTP_ONLY_PREFIX).unwrap_or(raw).trim_end();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let expires = match fields[4].trim().parse::<i64>() {
                Ok(0) => None,
                Ok(seconds) => DateTime::from_timestamp(seconds, 0),
                Err(_) => return None,
            };
            Some(CookieLine {
                domain: fields[0].to_string(),
                name: fields[5].to_string(),
                expires,
            })
        })
        .collect()
}

pub fn jar_status(cookies: &[CookieLine], now: DateTime<Utc>) -> CookieJarStatus {
    let mut status = CookieJarStatus {
        total: cookies.len(),
        ..CookieJarStatus::default()
    };
    for cookie in cookies {
        let Some(expires) = cookie.expires else {
            continue;
        };
        if expires <= now {
            status.expired += 1;
        } else if status.earliest_expiry.is_none_or(|earliest| expires < earliest) {
            status.earliest_expiry = Some(expires);
        }
    }
    status
}

/// Reads and inspects the jar at `path`. A missing or unreadable file counts
/// as an empty jar.
pub fn inspect_cookie_file(path: &Path) -> CookieJarStatus {
    match fs::read_to_string(path) {
        Ok(contents) => jar_status(&parse_cookie_jar(&contents), Utc::now()),
        Err(err) => {
            debug!("cookie jar {} not readable: {err}", path.display());
            CookieJarStatus::default()
        }
    }
}
