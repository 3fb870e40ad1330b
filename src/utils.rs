use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::errors::Result;

/// Domains that usually point at an off-site mirror of the video
const SUSPICIOUS_DOMAINS: &[&str] = &[
    "pan.baidu",
    "/s/",
    "mega.nz",
    "drive.google.com",
    "aliyundrive",
    "uploadgig",
    "katfile",
    "storex",
    "subyshare",
    "rapidgator",
    "filebe",
    "filespace",
    "mexa.sh",
    "mexashare",
    "mx-sh.net",
    "uploaded.",
    "icerbox",
    "alfafile",
    "1drv.ms",
    "onedrive.",
    "pixeldrain.",
    "gigafile.nu",
];

/// Result of comparing two dotted version strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    Low,
    Equal,
    High,
}

pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return 0;
    }
    (value + divisor - 1) / divisor
}

/// Replaces characters that are not allowed in file names, and a leading dot, with `_`
pub fn sanitize_filename(filename: &str) -> String {
    let mut sanitized: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    if sanitized.starts_with('.') {
        sanitized.replace_range(..1, "_");
    }
    sanitized
}

/// NFKC-folds compatibility forms, so full-width `ｍｅｇａ.ｎｚ` reads as `mega.nz`
pub fn normalize_text(text: &str) -> String {
    text.nfkc().collect()
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        log::info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Generates a unique ID for JSON-RPC requests
pub fn generate_rpc_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Compares `current` against `other`, segment by segment. Missing or
/// non-numeric segments count as zero.
pub fn compare_versions(current: &str, other: &str) -> VersionState {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(current), parse(other));
    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Less => return VersionState::Low,
            Ordering::Greater => return VersionState::High,
            Ordering::Equal => {}
        }
    }
    VersionState::Equal
}

/// Splits this build's version into the numeric triplet sent to RPC backends
pub fn version_triplet() -> [u64; 3] {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|p| p.parse().unwrap_or(0));
    [
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    ]
}

/// Returns the first known mirror domain mentioned in `text`
pub fn find_download_link_domain(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    SUSPICIOUS_DOMAINS
        .iter()
        .copied()
        .find(|domain| lowered.contains(domain))
}

fn bracket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\[\]]+)\]").expect("valid bracket regex"))
}

fn underscore_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_([^_]+)_").expect("valid underscore regex"))
}

/// Pulls video IDs out of a `|` separated list of IDs or file names.
///
/// `Title[id].mp4` yields the last bracketed group, `Title_id_.mp4` the last
/// underscore-delimited group, anything else is taken as the ID itself.
pub fn parse_manual_ids(input: &str) -> Vec<String> {
    input
        .split('|')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let id = bracket_regex()
                .captures_iter(item)
                .last()
                .or_else(|| underscore_regex().captures_iter(item).last())
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str())
                .unwrap_or(item);
            id.trim().to_lowercase()
        })
        .collect()
}
