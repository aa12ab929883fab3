//! Internal link rewriting.
//!
//! `[[target]]` and `[[target|alias]]` become Hexo `post_link` tags when the
//! target is a published note, plain text otherwise. Embeds (`![[...]]`) are
//! left for the asset extractor.

use std::collections::HashMap;

use crate::publish::sanitize::sanitize;
use crate::vault::markup::WIKILINK_RE;
use crate::vault::{Vault, file_name, file_stem};

/// Rewrite every internal link in `body`, written in note `source`.
///
/// `mapping` is the note-path to published-file-name table used to find the
/// post ID of link targets.
pub fn rewrite_links(
    body: &str,
    source: &str,
    vault: &dyn Vault,
    mapping: &HashMap<String, String>,
) -> String {
    let mut out = String::with_capacity(body.len());
    let mut last = 0;

    for caps in WIKILINK_RE.captures_iter(body) {
        let (Some(whole), Some(target)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if body[..whole.start()].ends_with('!') {
            continue;
        }
        let alias = caps
            .get(2)
            .map(|m| m.as_str().trim())
            .filter(|a| !a.is_empty());

        out.push_str(&body[last..whole.start()]);
        out.push_str(&replacement(target.as_str(), alias, source, vault, mapping));
        last = whole.end();
    }
    out.push_str(&body[last..]);
    out
}

fn replacement(
    target: &str,
    alias: Option<&str>,
    source: &str,
    vault: &dyn Vault,
    mapping: &HashMap<String, String>,
) -> String {
    let Some(resolved) = vault.resolve_link(target, source) else {
        return alias.unwrap_or(target).to_string();
    };

    let frontmatter = vault.frontmatter(&resolved);
    let display = alias
        .map(str::to_string)
        .or_else(|| {
            frontmatter
                .as_ref()
                .and_then(|fm| fm.get_str("title"))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
        .unwrap_or_else(|| file_stem(&resolved).to_string());

    if !frontmatter.as_ref().is_some_and(|fm| fm.is_published()) {
        return display;
    }

    let id = post_id(&resolved, mapping);
    format!("{{% post_link {id} \"{display}\" %}}")
}

/// Post ID of a published note: the stem of its published file name.
pub fn post_id(note: &str, mapping: &HashMap<String, String>) -> String {
    match mapping.get(note) {
        Some(published) => file_stem(published).to_string(),
        None => file_stem(&sanitize(file_name(note))).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::FsVault;
    use std::fs;
    use tempfile::TempDir;

    fn vault_with(files: &[(&str, &str)]) -> (TempDir, FsVault) {
        let tmp = TempDir::new().unwrap();
        for (path, content) in files {
            let abs = tmp.path().join(path);
            fs::create_dir_all(abs.parent().unwrap()).unwrap();
            fs::write(abs, content).unwrap();
        }
        let vault = FsVault::new(tmp.path());
        (tmp, vault)
    }

    #[test]
    fn test_published_target_becomes_post_link() {
        let (_tmp, vault) = vault_with(&[
            ("src.md", ""),
            ("Other Note.md", "---\ntitle: The Other\npublished: true\n---\n"),
        ]);
        let mapping = HashMap::from([("Other Note.md".to_string(), "other-note-1.md".to_string())]);

        assert_eq!(
            rewrite_links("see [[Other Note]]", "src.md", &vault, &mapping),
            "see {% post_link other-note-1 \"The Other\" %}"
        );
        assert_eq!(
            rewrite_links("see [[Other Note|here]]", "src.md", &vault, &mapping),
            "see {% post_link other-note-1 \"here\" %}"
        );
    }

    #[test]
    fn test_unmapped_published_target_uses_sanitized_stem() {
        let (_tmp, vault) = vault_with(&[("src.md", ""), ("My Target.md", "---\npublished: true\n---\n")]);
        assert_eq!(
            rewrite_links("[[My Target#Intro]]", "src.md", &vault, &HashMap::new()),
            "{% post_link my-target \"My Target\" %}"
        );
    }

    #[test]
    fn test_unpublished_and_unresolved_targets() {
        let (_tmp, vault) = vault_with(&[
            ("src.md", ""),
            ("Draft.md", "---\ntitle: Draft Title\npublished: false\n---\n"),
        ]);
        let mapping = HashMap::new();
        assert_eq!(rewrite_links("[[Draft]]", "src.md", &vault, &mapping), "Draft Title");
        assert_eq!(rewrite_links("[[Draft|d]]", "src.md", &vault, &mapping), "d");
        assert_eq!(rewrite_links("[[Nowhere]]", "src.md", &vault, &mapping), "Nowhere");
        assert_eq!(rewrite_links("[[Nowhere|n]]", "src.md", &vault, &mapping), "n");
    }

    #[test]
    fn test_embeds_untouched() {
        let (_tmp, vault) = vault_with(&[("src.md", ""), ("doc.pdf", "")]);
        let body = "a ![[doc.pdf]] b [[doc.pdf|file]]";
        assert_eq!(
            rewrite_links(body, "src.md", &vault, &HashMap::new()),
            "a ![[doc.pdf]] b file"
        );
    }

    #[test]
    fn test_post_id() {
        let mapping = HashMap::from([("a/B.md".to_string(), "b-2.md".to_string())]);
        assert_eq!(post_id("a/B.md", &mapping), "b-2");
        assert_eq!(post_id("a/Hello World.md", &mapping), "hello-world");
    }
}
