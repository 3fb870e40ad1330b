use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::errors::{AppError, Result};

const MAX_PASSES: usize = 128;
const DEFAULT_DATE_FORMAT: &str = "YYYY-MM-DD";

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Text(String),
    Date(DateTime<FixedOffset>),
}

impl TemplateValue {
    fn render(&self, format: Option<&str>) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Date(date) => format_date(date, format.unwrap_or(DEFAULT_DATE_FORMAT)),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<FixedOffset>> for TemplateValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Self::Date(value)
    }
}

/// Variables a template may reference, keyed by placeholder name
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: HashMap<String, TemplateValue>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<TemplateValue>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.values.get(name)
    }
}

/// A rendered path split the way download backends want it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPath {
    pub full_path: String,
    pub drive: String,
    pub directory: String,
    pub filename: String,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"%#([A-Za-z0-9_]+)(?::([^#]*))?#%").expect("placeholder pattern is valid")
    })
}

fn local_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z]:)?[/\\]?([^/\\]+[/\\])*([^/\\]+\.\w+)$")
            .expect("path pattern is valid")
    })
}

fn has_known_placeholder(text: &str, vars: &TemplateVars) -> bool {
    placeholder_regex()
        .captures_iter(text)
        .any(|caps| vars.get(&caps[1]).is_some())
}

fn expand_once(text: &str, vars: &TemplateVars) -> String {
    placeholder_regex()
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.render(caps.get(2).map(|m| m.as_str())),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitutes every recognized `%#NAME#%` / `%#NAME:FORMAT#%` placeholder.
///
/// Substituted values may themselves contain placeholders, so expansion repeats until
/// none of the known names remain or 128 passes have run. Unknown names are kept verbatim.
pub fn expand(template: &str, vars: &TemplateVars) -> String {
    let mut current = template.to_string();
    for _ in 0..MAX_PASSES {
        if !has_known_placeholder(&current, vars) {
            break;
        }
        current = expand_once(&current, vars);
    }
    current
}

/// Parses an expanded path into drive, directory and file name
pub fn parse_local_path(path: &str) -> Result<LocalPath> {
    let normalized = path.replace("//", "/").replace("\\\\", "/");
    let caps = local_path_regex()
        .captures(&normalized)
        .ok_or_else(|| AppError::PathFormat(path.to_string()))?;

    let full_path = caps[0].to_string();
    let filename = caps
        .get(3)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| AppError::PathFormat(path.to_string()))?;
    let directory = full_path[..full_path.len() - filename.len()].to_string();

    Ok(LocalPath {
        drive: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        directory,
        filename,
        full_path,
    })
}

/// Expands `template`, trims it and validates the result as a file path
pub fn render(template: &str, vars: &TemplateVars) -> Result<LocalPath> {
    parse_local_path(expand(template, vars).trim())
}

// Longest tokens first so that "YYYY" wins over "YY" and "MMMM" over "MM".
const DATE_TOKENS: [(&str, &str); 22] = [
    ("YYYY", "%Y"),
    ("MMMM", "%B"),
    ("dddd", "%A"),
    ("MMM", "%b"),
    ("ddd", "%a"),
    ("SSS", "%3f"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("hh", "%I"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("M", "%-m"),
    ("D", "%-d"),
    ("H", "%-H"),
    ("h", "%-I"),
    ("m", "%-M"),
    ("s", "%-S"),
    ("A", "%p"),
    ("a", "%P"),
    ("X", "%s"),
];

/// Translates moment.js style tokens into a strftime pattern. Text inside `[...]`
/// is kept literally.
pub fn moment_to_strftime(format: &str) -> String {
    let mut out = String::new();
    let mut rest = format;

    while let Some(ch) = rest.chars().next() {
        if let Some(literal) = rest.strip_prefix('[') {
            let end = literal.find(']').unwrap_or(literal.len());
            out.push_str(&literal[..end].replace('%', "%%"));
            rest = literal.get(end + 1..).unwrap_or_default();
            continue;
        }

        match DATE_TOKENS.iter().find(|(token, _)| rest.starts_with(token)) {
            Some((token, spec)) => {
                out.push_str(spec);
                rest = &rest[token.len()..];
            }
            None => {
                if ch == '%' {
                    out.push('%');
                }
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }

    out
}

/// Formats a date with moment.js style tokens
pub fn format_date(date: &DateTime<FixedOffset>, format: &str) -> String {
    let pattern = moment_to_strftime(format);
    let items: Vec<Item> = StrftimeItems::new(&pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        log::warn!("⚠️ [PATH] Unusable date format {:?}", format);
        return format.to_string();
    }
    date.format_with_items(items.into_iter()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vars() -> TemplateVars {
        let upload = DateTime::parse_from_rfc3339("2023-04-05T06:07:08+00:00").unwrap();
        TemplateVars::new()
            .with("AUTHOR", "alice")
            .with("TITLE", "demo")
            .with("ID", "abc123")
            .with("UploadTime", upload)
    }

    #[test]
    fn expands_the_default_template() {
        let path = render("/Iwara/%#AUTHOR#%/%#TITLE#%[%#ID#%].mp4", &sample_vars()).unwrap();
        assert_eq!(path.full_path, "/Iwara/alice/demo[abc123].mp4");
        assert_eq!(path.directory, "/Iwara/alice/");
        assert_eq!(path.filename, "demo[abc123].mp4");
        assert_eq!(path.drive, "");
    }

    #[test]
    fn formats_dates_with_and_without_pattern() {
        let vars = sample_vars();
        assert_eq!(expand("%#UploadTime#%", &vars), "2023-04-05");
        assert_eq!(
            expand("%#UploadTime:YYYYMMDD_HHmmss#%", &vars),
            "20230405_060708"
        );
        assert_eq!(
            expand("%#UploadTime:[at] h A, MMM D#%", &vars),
            "at 6 AM, Apr 5"
        );
    }

    #[test]
    fn moment_tokens_map_to_strftime() {
        assert_eq!(moment_to_strftime("YYYY-MM-DD HH:mm:ss"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(moment_to_strftime("dddd, MMMM D"), "%A, %B %-d");
        assert_eq!(moment_to_strftime("[100%] YY"), "100%% %y");
        assert_eq!(moment_to_strftime("h:mm a"), "%-I:%M %P");
    }

    #[test]
    fn long_names_and_unpadded_fields_render() {
        let date = DateTime::parse_from_rfc3339("2023-04-05T06:07:08+00:00").unwrap();
        assert_eq!(format_date(&date, "dddd D MMMM YYYY"), "Wednesday 5 April 2023");
        assert_eq!(format_date(&date, "YY/M/D H:m:s"), "23/4/5 6:7:8");
        assert_eq!(format_date(&date, "[50%] SSS"), "50% 000");
    }

    #[test]
    fn format_is_ignored_for_text_values() {
        assert_eq!(expand("%#AUTHOR:YYYY#%", &sample_vars()), "alice");
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        assert_eq!(
            expand("%#AUTHOR#%-%#UNKNOWN#%-%#Other:YYYY#%", &sample_vars()),
            "alice-%#UNKNOWN#%-%#Other:YYYY#%"
        );
    }

    #[test]
    fn nested_placeholders_expand_in_later_passes() {
        let vars = sample_vars().with("ALIAS", "%#AUTHOR#%_%#ID#%");
        assert_eq!(expand("%#ALIAS#%", &vars), "alice_abc123");
    }

    #[test]
    fn self_referencing_value_stops_after_bounded_passes() {
        let vars = TemplateVars::new().with("TITLE", "x%#TITLE#%");
        let out = expand("%#TITLE#%", &vars);
        assert_eq!(out.matches('x').count(), MAX_PASSES);
        assert!(out.ends_with("%#TITLE#%"));
    }

    #[test]
    fn expansion_is_idempotent_once_settled() {
        let vars = sample_vars().with("ALIAS", "%#TITLE#%");
        for template in [
            "/Iwara/%#AUTHOR#%/%#TITLE#%[%#ID#%].mp4",
            "%#ALIAS#% %#NOPE#%",
            "%#UploadTime:YYYY#%/%#QUALITY#%",
        ] {
            let once = expand(template, &vars);
            assert_eq!(expand(&once, &vars), once);
        }
    }

    #[test]
    fn windows_paths_keep_their_drive() {
        let path = parse_local_path("D:\\Videos\\alice\\demo[abc].mp4").unwrap();
        assert_eq!(path.drive, "D:");
        assert_eq!(path.filename, "demo[abc].mp4");
        assert_eq!(path.directory, "D:\\Videos\\alice\\");
    }

    #[test]
    fn doubled_separators_are_collapsed() {
        let path = parse_local_path("/Iwara//alice//demo.mp4").unwrap();
        assert_eq!(path.full_path, "/Iwara/alice/demo.mp4");
    }

    #[test]
    fn paths_without_extension_are_rejected() {
        assert!(matches!(
            parse_local_path("/Iwara/alice/demo"),
            Err(AppError::PathFormat(_))
        ));
        assert!(matches!(parse_local_path(""), Err(AppError::PathFormat(_))));
        assert!(matches!(
            parse_local_path("/Iwara/alice/"),
            Err(AppError::PathFormat(_))
        ));
    }

    #[test]
    fn relative_file_name_is_accepted() {
        let path = parse_local_path("demo[abc].mp4").unwrap();
        assert_eq!(path.directory, "");
        assert_eq!(path.filename, "demo[abc].mp4");
    }
}
