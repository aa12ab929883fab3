//! Just enough markdown knowledge to find front-matter and embeds.
//!
//! Bodies are treated as opaque text; nothing here parses markdown structure.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Frontmatter;

/// Image/file embeds in either syntax.
///
/// Groups: 1 wiki target, 2 wiki alias, 3 markdown alt, 4 markdown target.
pub static EMBED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[\[([^\]|]+)(?:\|([^\]]*))?\]\]|!\[([^\]]*)\]\(([^)]+)\)")
        .expect("valid embed regex")
});

/// Internal links: `[[target]]` or `[[target|alias]]`.
pub static WIKILINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\]|]+)(?:\|([^\]]+))?\]\]").expect("valid wikilink regex")
});

/// One embed occurrence found in a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedMatch<'a> {
    /// Link text exactly as written.
    pub link: &'a str,
    /// Alias or alt text, empty when absent.
    pub alt: &'a str,
}

/// Extract the embed from a regex capture of [`EMBED_RE`].
pub fn embed_from_captures<'a>(caps: &regex::Captures<'a>) -> Option<EmbedMatch<'a>> {
    if let Some(link) = caps.get(1) {
        return Some(EmbedMatch {
            link: link.as_str(),
            alt: caps.get(2).map(|m| m.as_str()).unwrap_or(""),
        });
    }
    caps.get(4).map(|link| EmbedMatch {
        link: link.as_str(),
        alt: caps.get(3).map(|m| m.as_str()).unwrap_or(""),
    })
}

/// Embed link texts in order of first appearance, deduplicated.
///
/// Remote URLs (`scheme://`) are skipped.
pub fn scan_embeds(body: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for caps in EMBED_RE.captures_iter(body) {
        let Some(embed) = embed_from_captures(&caps) else {
            continue;
        };
        if embed.link.contains("://") {
            continue;
        }
        if seen.insert(embed.link.to_string()) {
            out.push(embed.link.to_string());
        }
    }
    out
}

/// Normalize a raw link target for resolution.
///
/// Drops `#heading`/`^block` suffixes and `<...>` wrappers and decodes `%20`
/// style escapes used by markdown links.
pub fn clean_link_target(raw: &str) -> String {
    let trimmed = raw.trim();
    let unwrapped = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);
    let without_anchor = unwrapped.split('#').next().unwrap_or("").trim();
    urlencoding::decode(without_anchor)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| without_anchor.to_string())
}

/// Split a document into its YAML header and the rest.
///
/// The header must open on the first line with `---` and close with a line
/// that is exactly `---` or `...`. Returns `(None, text)` otherwise.
pub fn split_document(text: &str) -> (Option<&str>, &str) {
    let Some(after_open) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\n', '\r']);
        if bare == "---" || bare == "..." {
            let yaml = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }
    (None, text)
}

/// Parse the YAML header of a document. Missing header yields an empty map.
pub fn parse_frontmatter(text: &str) -> Result<(Frontmatter, &str), serde_yaml::Error> {
    let (yaml, body) = split_document(text);
    let frontmatter = match yaml {
        Some(yaml) if !yaml.trim().is_empty() => {
            let mapping: serde_yaml::Mapping = serde_yaml::from_str(yaml)?;
            Frontmatter::from(mapping)
        }
        _ => Frontmatter::default(),
    };
    Ok((frontmatter, body))
}

/// Render a header and body back into one document.
pub fn render_document(frontmatter: &Frontmatter, body: &str) -> Result<String, serde_yaml::Error> {
    let mut out = String::from("---\n");
    if !frontmatter.is_empty() {
        out.push_str(&serde_yaml::to_string(frontmatter.as_mapping())?);
    }
    out.push_str("---\n");
    out.push_str(body);
    Ok(out)
}
