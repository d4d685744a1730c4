//! Client-facing file names: template expansion plus sanitizing.

use tracing::debug;

const MAX_STEM_LEN: usize = 150;
const DEFAULT_STEM: &str = "download";
const DEFAULT_EXT: &str = "bin";

/// Values a template may reference.
#[derive(Debug, Clone, Default)]
pub struct FilenameFields<'a> {
    pub title: Option<&'a str>,
    pub uploader: Option<&'a str>,
    pub id: &'a str,
    pub resolution: Option<&'a str>,
    pub format: Option<&'a str>,
}

impl FilenameFields<'_> {
    fn fallback_stem(&self) -> &str {
        self.title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(self.id)
    }

    fn lookup(&self, key: &str, ext: &str) -> Option<String> {
        let value = match key {
            "title" => self.fallback_stem(),
            "uploader" => self.uploader.unwrap_or("unknown"),
            "id" => self.id,
            "ext" => ext,
            "resolution" => self.resolution.unwrap_or("source"),
            "format" => self.format.unwrap_or("best"),
            _ => return None,
        };
        Some(value.to_string())
    }
}

/// Builds a safe `stem.ext` name.
///
/// Templates use `{title}`, `{uploader}`, `{id}`, `{ext}`, `{resolution}` and
/// `{format}`. Anything the expander cannot handle falls back to the title (or
/// id). The result only ever contains `[A-Za-z0-9._-]`.
pub fn build(template: Option<&str>, fields: &FilenameFields<'_>, ext: &str) -> String {
    let ext = sanitize_extension(ext);
    let raw_stem = template
        .map(str::trim)
        .filter(|template| !template.is_empty())
        .and_then(|template| match expand(template, fields, &ext) {
            Some(expanded) => Some(expanded),
            None => {
                debug!(template, "filename template rejected, using title");
                None
            }
        })
        .unwrap_or_else(|| fields.fallback_stem().to_string());

    let mut stem = sanitize_stem(&raw_stem);
    let suffix = format!(".{ext}");
    if stem.len() > suffix.len() && stem.to_ascii_lowercase().ends_with(&suffix) {
        stem.truncate(stem.len() - suffix.len());
        stem = sanitize_stem(&stem);
    }
    format!("{stem}.{ext}")
}

fn expand(template: &str, fields: &FilenameFields<'_>, ext: &str) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        '{' => return None,
                        other => key.push(other),
                    }
                }
                out.push_str(&fields.lookup(key.trim(), ext)?);
            }
            '}' => return None,
            other => out.push(other),
        }
    }
    Some(out)
}

fn sanitize_stem(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            cleaned.push(ch);
            in_run = false;
        } else if !in_run {
            cleaned.push('_');
            in_run = true;
        }
    }

    let trimmed = cleaned.trim_matches(|ch| ch == '_' || ch == '.');
    let capped: String = trimmed.chars().take(MAX_STEM_LEN).collect();
    let capped = capped.trim_end_matches(|ch| ch == '_' || ch == '.');
    if capped.is_empty() {
        DEFAULT_STEM.to_string()
    } else {
        capped.to_string()
    }
}

fn sanitize_extension(ext: &str) -> String {
    let cleaned: String = ext
        .trim()
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .take(10)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_EXT.to_string()
    } else {
        cleaned
    }
}

/// `Content-Disposition` value for an already sanitized name.
pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{filename}\"")
}
