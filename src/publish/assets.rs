//! Image materialization into a post's asset folder.
//!
//! Hexo's `post_asset_folder` layout keeps images next to the post in a
//! directory named after the post's file stem. Embeds and the cover image are
//! copied there (optionally re-encoded as WebP) and the embed syntax is
//! rewritten to point at the copied name. The source note is never modified.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::state::{ImageSyntax, Settings};
use crate::vault::markup::{EMBED_RE, embed_from_captures};
use crate::vault::{Vault, VaultError, extension, file_name, file_stem};

/// Extensions treated as images, lower-case.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "svg", "webp"];

#[derive(Error, Debug)]
pub enum AssetError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Asset I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode image {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to encode {name} as WebP: {message}")]
    Encode { name: String, message: String },

    #[error("Image worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Whether a path has one of [`IMAGE_EXTENSIONS`].
pub fn is_image(path: &str) -> bool {
    extension(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Vector and animated images are never re-encoded.
fn is_compressible(path: &str) -> bool {
    is_image(path) && !matches!(extension(path).as_deref(), Some("svg" | "gif"))
}

/// Reduce a cover field value like `"![[dir/c.png|Cover]]"` to a link target.
pub fn clean_cover_link(raw: &str) -> String {
    let s = raw.trim().trim_matches(['"', '\'']).trim();
    let s = s.strip_prefix('!').unwrap_or(s);
    let s = s.trim_start_matches("[[").trim_end_matches("]]");
    s.split('|').next().unwrap_or("").trim().to_string()
}

/// `<posts_dir>/<stem of published file name>`.
pub fn asset_dir_for(posts_dir: &Path, published_name: &str) -> PathBuf {
    posts_dir.join(file_stem(published_name))
}

/// Render one image reference in the configured syntax.
pub fn render_image(syntax: ImageSyntax, name: &str, alt: &str) -> String {
    match syntax {
        ImageSyntax::Hexo => format!("{{% asset_img {name} {alt} %}}"),
        ImageSyntax::Markdown => format!("![{alt}]({name})"),
    }
}

/// Decode any supported raster format and re-encode it as lossy WebP.
pub fn encode_webp(name: &str, bytes: &[u8], quality: u8) -> Result<Vec<u8>, AssetError> {
    let img = image::load_from_memory(bytes).map_err(|source| AssetError::Decode {
        name: name.to_string(),
        source,
    })?;
    let img = image::DynamicImage::ImageRgba8(img.to_rgba8());
    let encoder = webp::Encoder::from_image(&img).map_err(|e| AssetError::Encode {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    Ok(encoder.encode(f32::from(quality.min(100))).deref().to_owned())
}

/// How images are copied and referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetOptions {
    pub compress: bool,
    pub quality: u8,
    pub syntax: ImageSyntax,
}

impl AssetOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            compress: settings.compress_images,
            quality: settings.webp_quality,
            syntax: settings.image_syntax,
        }
    }

    /// Name a source image gets inside the asset folder.
    pub fn final_name(&self, source: &str) -> String {
        if self.compress && is_compressible(source) {
            format!("{}.webp", file_stem(source))
        } else {
            file_name(source).to_string()
        }
    }
}

/// Copies a note's images into one asset folder.
pub struct AssetExtractor<'a> {
    vault: &'a dyn Vault,
    options: AssetOptions,
}

impl<'a> AssetExtractor<'a> {
    pub fn new(vault: &'a dyn Vault, options: AssetOptions) -> Self {
        Self { vault, options }
    }

    /// Resolve `link` from `note` to a vault image path.
    fn resolve_image(&self, link: &str, note: &str) -> Option<String> {
        self.vault
            .resolve_link(link, note)
            .filter(|resolved| is_image(resolved))
    }

    /// Copy `source` into `asset_dir` unless its final name is already in
    /// `processed`. Returns the final name.
    pub async fn ensure_copied(
        &self,
        source: &str,
        asset_dir: &Path,
        processed: &mut HashSet<String>,
    ) -> Result<String, AssetError> {
        let final_name = self.options.final_name(source);
        if processed.contains(&final_name) {
            return Ok(final_name);
        }

        tokio::fs::create_dir_all(asset_dir).await?;
        let bytes = self.vault.read_binary(source).await?;
        let target = asset_dir.join(&final_name);

        if self.options.compress && is_compressible(source) {
            let name = source.to_string();
            let quality = self.options.quality;
            let encoded =
                tokio::task::spawn_blocking(move || encode_webp(&name, &bytes, quality)).await??;
            tokio::fs::write(&target, encoded).await?;
            tracing::debug!(source, target = %target.display(), quality, "compressed image");
        } else {
            tokio::fs::write(&target, bytes).await?;
            tracing::debug!(source, target = %target.display(), "copied image");
        }

        processed.insert(final_name.clone());
        Ok(final_name)
    }

    /// Materialize every image embedded in `note` and rewrite the embeds in
    /// `body`. Embeds that do not resolve to an image are left as written.
    pub async fn process_embeds(
        &self,
        note: &str,
        body: &str,
        asset_dir: &Path,
        processed: &mut HashSet<String>,
    ) -> Result<String, AssetError> {
        let mut finals: HashMap<String, String> = HashMap::new();
        for link in self.vault.embeds(note) {
            let Some(source) = self.resolve_image(&link, note) else {
                continue;
            };
            let final_name = self.ensure_copied(&source, asset_dir, processed).await?;
            finals.insert(link, final_name);
        }
        if finals.is_empty() {
            return Ok(body.to_string());
        }

        let mut out = String::with_capacity(body.len());
        let mut last = 0;
        for caps in EMBED_RE.captures_iter(body) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let Some(embed) = embed_from_captures(&caps) else {
                continue;
            };
            let Some(final_name) = finals.get(embed.link) else {
                continue;
            };
            out.push_str(&body[last..whole.start()]);
            out.push_str(&render_image(self.options.syntax, final_name, embed.alt));
            last = whole.end();
        }
        out.push_str(&body[last..]);
        Ok(out)
    }

    /// Materialize the cover image. Returns the final name when the value
    /// resolves to an image.
    pub async fn process_cover(
        &self,
        note: &str,
        cover_value: &str,
        asset_dir: &Path,
        processed: &mut HashSet<String>,
    ) -> Result<Option<String>, AssetError> {
        let link = clean_cover_link(cover_value);
        if link.is_empty() {
            return Ok(None);
        }
        match self.resolve_image(&link, note) {
            Some(source) => Ok(Some(
                self.ensure_copied(&source, asset_dir, processed).await?,
            )),
            None => {
                tracing::debug!(note, cover = %link, "cover does not resolve to an image");
                Ok(None)
            }
        }
    }

    /// Asset-folder names that `note` still references, in both their source
    /// and compressed forms.
    pub fn referenced_names(&self, note: &str, cover_value: Option<&str>) -> HashSet<String> {
        let mut links = self.vault.embeds(note);
        if let Some(cover) = cover_value {
            let link = clean_cover_link(cover);
            if !link.is_empty() {
                links.push(link);
            }
        }

        let mut names = HashSet::new();
        for link in links {
            if let Some(source) = self.resolve_image(&link, note) {
                names.insert(file_name(&source).to_string());
                if is_compressible(&source) {
                    names.insert(format!("{}.webp", file_stem(&source)));
                }
            }
        }
        names
    }
}

/// Image files in `asset_dir` not in `referenced`, sorted. A missing folder
/// has no unused assets.
pub fn find_unused(asset_dir: &Path, referenced: &HashSet<String>) -> Result<Vec<String>, AssetError> {
    let entries = match std::fs::read_dir(asset_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut unused = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_image(&name) && !referenced.contains(&name) {
            unused.push(name);
        }
    }
    unused.sort();
    Ok(unused)
}

/// Remove `names` from `asset_dir`. Already-missing files are skipped.
/// Returns how many files were removed.
pub async fn delete_assets(asset_dir: &Path, names: &[String]) -> Result<usize, AssetError> {
    let mut removed = 0;
    for name in names {
        // Names come from directory listings; never follow a path out of the folder.
        if name.contains(['/', '\\']) || name == ".." {
            tracing::warn!(name, "refusing to delete asset outside its folder");
            continue;
        }
        let path = asset_dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                tracing::info!(path = %path.display(), "deleted unused asset");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::FsVault;
    use std::fs;
    use tempfile::TempDir;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 10, 10, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn setup(files: &[(&str, &[u8])]) -> (TempDir, FsVault, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let vault_dir = tmp.path().join("vault");
        for (path, content) in files {
            let abs = vault_dir.join(path);
            fs::create_dir_all(abs.parent().unwrap()).unwrap();
            fs::write(abs, content).unwrap();
        }
        fs::create_dir_all(&vault_dir).unwrap();
        let asset_dir = tmp.path().join("posts").join("note");
        (tmp, FsVault::new(vault_dir), asset_dir)
    }

    fn options(syntax: ImageSyntax, compress: bool) -> AssetOptions {
        AssetOptions {
            compress,
            quality: 75,
            syntax,
        }
    }

    #[test]
    fn test_clean_cover_link() {
        assert_eq!(clean_cover_link("\"![[img/c.png|Cover]]\""), "img/c.png");
        assert_eq!(clean_cover_link("[[c.png]]"), "c.png");
        assert_eq!(clean_cover_link("c.png"), "c.png");
        assert_eq!(clean_cover_link("  "), "");
    }

    #[test]
    fn test_render_image() {
        assert_eq!(render_image(ImageSyntax::Hexo, "cat.png", ""), "{% asset_img cat.png  %}");
        assert_eq!(
            render_image(ImageSyntax::Hexo, "cat.png", "A cat"),
            "{% asset_img cat.png A cat %}"
        );
        assert_eq!(render_image(ImageSyntax::Markdown, "cat.png", "x"), "![x](cat.png)");
    }

    #[test]
    fn test_final_name() {
        let plain = options(ImageSyntax::Hexo, false);
        let compress = options(ImageSyntax::Hexo, true);
        assert_eq!(plain.final_name("img/Cat.PNG"), "Cat.PNG");
        assert_eq!(compress.final_name("img/Cat.PNG"), "Cat.webp");
        assert_eq!(compress.final_name("a.svg"), "a.svg");
        assert_eq!(compress.final_name("a.gif"), "a.gif");
    }

    #[tokio::test]
    async fn test_process_embeds_rewrites_both_syntaxes() {
        let body = "![[cat.png]] and ![[cat.png|Kitty]] and ![dog](img/dog.jpg) ![[doc.pdf]] ![[gone.png]]";
        let (_tmp, vault, asset_dir) = setup(&[
            ("note.md", body.as_bytes()),
            ("cat.png", b"cat"),
            ("img/dog.jpg", b"dog"),
            ("doc.pdf", b"pdf"),
        ]);
        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Hexo, false));
        let mut processed = HashSet::new();
        let out = extractor
            .process_embeds("note.md", body, &asset_dir, &mut processed)
            .await
            .unwrap();

        assert_eq!(
            out,
            "{% asset_img cat.png  %} and {% asset_img cat.png Kitty %} and \
             {% asset_img dog.jpg dog %} ![[doc.pdf]] ![[gone.png]]"
        );
        assert_eq!(fs::read(asset_dir.join("cat.png")).unwrap(), b"cat");
        assert_eq!(fs::read(asset_dir.join("dog.jpg")).unwrap(), b"dog");
        assert!(!asset_dir.join("doc.pdf").exists());
        assert_eq!(processed.len(), 2);
    }

    #[tokio::test]
    async fn test_process_embeds_markdown_syntax() {
        let body = "![[cat.png|Kitty]]";
        let (_tmp, vault, asset_dir) = setup(&[("note.md", body.as_bytes()), ("cat.png", b"c")]);
        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Markdown, false));
        let out = extractor
            .process_embeds("note.md", body, &asset_dir, &mut HashSet::new())
            .await
            .unwrap();
        assert_eq!(out, "![Kitty](cat.png)");
    }

    #[tokio::test]
    async fn test_processed_set_skips_second_copy() {
        let (_tmp, vault, asset_dir) = setup(&[("cat.png", b"new")]);
        fs::create_dir_all(&asset_dir).unwrap();
        fs::write(asset_dir.join("cat.png"), b"old").unwrap();

        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Hexo, false));
        let mut processed = HashSet::from(["cat.png".to_string()]);
        let name = extractor
            .ensure_copied("cat.png", &asset_dir, &mut processed)
            .await
            .unwrap();
        assert_eq!(name, "cat.png");
        assert_eq!(fs::read(asset_dir.join("cat.png")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_compression_writes_webp() {
        let png = png_bytes();
        let body = "![[cat.png]] ![[logo.svg]]";
        let (_tmp, vault, asset_dir) = setup(&[
            ("note.md", body.as_bytes()),
            ("cat.png", &png),
            ("logo.svg", b"<svg/>"),
        ]);
        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Hexo, true));
        let out = extractor
            .process_embeds("note.md", body, &asset_dir, &mut HashSet::new())
            .await
            .unwrap();

        assert_eq!(out, "{% asset_img cat.webp  %} {% asset_img logo.svg  %}");
        let webp = fs::read(asset_dir.join("cat.webp")).unwrap();
        assert_eq!(&webp[..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");
        assert_eq!(fs::read(asset_dir.join("logo.svg")).unwrap(), b"<svg/>");
    }

    #[tokio::test]
    async fn test_compression_rejects_garbage() {
        let (_tmp, vault, asset_dir) = setup(&[("bad.png", b"not an image")]);
        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Hexo, true));
        let err = extractor
            .ensure_copied("bad.png", &asset_dir, &mut HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AssetError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_process_cover() {
        let (_tmp, vault, asset_dir) = setup(&[("note.md", b""), ("img/c.png", b"c")]);
        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Hexo, false));
        let mut processed = HashSet::new();
        let cover = extractor
            .process_cover("note.md", "[[img/c.png|Cover]]", &asset_dir, &mut processed)
            .await
            .unwrap();
        assert_eq!(cover.as_deref(), Some("c.png"));
        assert!(processed.contains("c.png"));

        let missing = extractor
            .process_cover("note.md", "[[nope.png]]", &asset_dir, &mut processed)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_find_unused_and_referenced_names() {
        let (_tmp, vault, asset_dir) = setup(&[
            ("note.md", b"![[a.png]]"),
            ("a.png", b"a"),
            ("c.png", b"c"),
        ]);
        fs::create_dir_all(&asset_dir).unwrap();
        for name in ["a.png", "a.webp", "b.png", "c.png", "notes.txt"] {
            fs::write(asset_dir.join(name), b"x").unwrap();
        }

        let extractor = AssetExtractor::new(&vault, options(ImageSyntax::Hexo, false));
        let referenced = extractor.referenced_names("note.md", Some("[[c.png]]"));
        assert_eq!(find_unused(&asset_dir, &referenced).unwrap(), vec!["b.png"]);
    }

    #[test]
    fn test_find_unused_missing_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(find_unused(&tmp.path().join("nope"), &HashSet::new()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_assets() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.png"), b"x").unwrap();
        let removed = delete_assets(
            tmp.path(),
            &["b.png".to_string(), "missing.png".to_string(), "../x.png".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(removed, 1);
        assert!(!tmp.path().join("b.png").exists());
    }
}
