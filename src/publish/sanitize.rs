//! Generator-safe file names.

use std::path::Path;

/// Used when nothing survives sanitization.
pub const FALLBACK_STEM: &str = "post";

/// Split a file name into stem and extension (with its dot).
///
/// Dot-files have no extension, matching `path.extname` semantics.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Characters allowed to survive in a sanitized stem.
pub fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

/// Lower-case the stem, replace anything outside word characters and common
/// CJK ideographs with `-`, collapse and trim dashes. The extension is kept
/// verbatim.
pub fn sanitize(name: &str) -> String {
    let (stem, ext) = split_extension(name);

    let mut out = String::with_capacity(stem.len());
    for c in stem.chars().flat_map(char::to_lowercase) {
        let mapped = if is_allowed(c) { c } else { '-' };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches('-');
    let stem = if trimmed.is_empty() {
        FALLBACK_STEM
    } else {
        trimmed
    };
    format!("{stem}{ext}")
}

/// First of `name`, `stem-1.ext`, `stem-2.ext`, … that does not exist in
/// `target_dir`.
pub fn unique_name(target_dir: &Path, name: &str) -> String {
    let (stem, ext) = split_extension(name);
    let mut candidate = name.to_string();
    let mut counter = 0u32;
    while target_dir.join(&candidate).exists() {
        counter += 1;
        candidate = format!("{stem}-{counter}{ext}");
    }
    candidate
}
