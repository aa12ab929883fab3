//! Permalink derivation.
//!
//! [`PermalinkDeriver::derive`] never fails: every error is logged and
//! surfaces as an empty permalink, which the publisher then handles according
//! to the configured [`SlugStyle`].

use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest as _, Md5};
use pinyin::ToPinyin;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::state::{Settings, SlugStyle};

/// Public Baidu Translate endpoint.
pub const BAIDU_ENDPOINT: &str = "https://fanyi-api.baidu.com/api/trans/vip/translate";

/// Slug used when nothing usable remains.
pub const FALLBACK_SLUG: &str = "post";

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "in", "on", "at", "to",
    "for", "with", "by", "of", "from",
];

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("Baidu app ID or API key not configured")]
    MissingCredentials,

    #[error("Baidu translate error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Translation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed translation response: {0}")]
    Malformed(String),
}

/// Text translation into English.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String, TranslateError>;
}

/// Baidu Translate general text API, zh -> en.
#[derive(Debug, Clone)]
pub struct BaiduTranslator {
    client: reqwest::Client,
    endpoint: String,
    app_id: String,
    api_key: String,
}

impl BaiduTranslator {
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: BAIDU_ENDPOINT.to_string(),
            app_id: app_id.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.baidu_app_id.trim(),
            settings.baidu_api_key.trim(),
        )
    }

    /// Point the client at a different endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Translator for BaiduTranslator {
    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        if self.app_id.is_empty() || self.api_key.is_empty() {
            return Err(TranslateError::MissingCredentials);
        }

        let salt = chrono::Utc::now().timestamp_millis().to_string();
        let sign = sign(&self.app_id, text, &salt, &self.api_key);

        tracing::debug!(endpoint = %self.endpoint, "requesting translation");
        let body: serde_json::Value = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", text),
                ("from", "zh"),
                ("to", "en"),
                ("appid", self.app_id.as_str()),
                ("salt", salt.as_str()),
                ("sign", sign.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        parse_response(&body)
    }
}

/// `md5(appid + q + salt + secret)` as lowercase hex.
pub fn sign(app_id: &str, query: &str, salt: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(app_id.as_bytes());
    hasher.update(query.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the first translation from a Baidu response body.
///
/// `error_code` may arrive as a number or a string depending on the error.
pub fn parse_response(body: &serde_json::Value) -> Result<String, TranslateError> {
    if let Some(code) = body.get("error_code") {
        let code = match code {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let message = body
            .get("error_msg")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return Err(TranslateError::Remote { code, message });
    }

    body.get("trans_result")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .and_then(|first| first.get("dst"))
        .and_then(|dst| dst.as_str())
        .map(str::to_string)
        .ok_or_else(|| TranslateError::Malformed(body.to_string()))
}

/// Hex SHA-256 of a string.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Slugify free text into lowercase dash-separated words.
pub fn post_process(text: &str, remove_stop_words: bool, max_words: usize) -> String {
    let lowered = text.to_lowercase();
    let mut words: Vec<&str> = lowered
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|w| !w.is_empty())
        .collect();

    if remove_stop_words {
        words.retain(|w| !STOP_WORDS.contains(w));
    }
    if max_words > 0 {
        words.truncate(max_words);
    }

    if words.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        words.join("-")
    }
}

/// Initial consonant of a toneless pinyin syllable, if it has one.
fn syllable_initial(plain: &str) -> &str {
    for double in ["zh", "ch", "sh"] {
        if plain.starts_with(double) {
            return &plain[..2];
        }
    }
    match plain.chars().next() {
        Some(c) if "bpmfdtnlgkhjqxrzcsyw".contains(c) => &plain[..c.len_utf8()],
        _ => "",
    }
}

/// Pinyin initials of the Chinese characters in `text`, other characters kept.
pub fn pinyin_initials(text: &str) -> String {
    let mut out = String::new();
    for (c, py) in text.chars().zip(text.to_pinyin()) {
        match py {
            Some(py) => out.push_str(syllable_initial(py.plain())),
            None => out.push(c),
        }
    }

    let cleaned: String = out
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    if cleaned.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        cleaned
    }
}

/// Append `/` unless the permalink is empty or already ends in `/` or `.html`.
pub fn normalize(permalink: String) -> String {
    if permalink.is_empty() || permalink.ends_with('/') || permalink.ends_with(".html") {
        permalink
    } else {
        format!("{permalink}/")
    }
}

/// Permalink generation under one set of settings.
#[derive(Clone)]
pub struct PermalinkDeriver {
    style: SlugStyle,
    remove_stop_words: bool,
    max_slug_words: usize,
    translator: Arc<dyn Translator>,
}

impl std::fmt::Debug for PermalinkDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermalinkDeriver")
            .field("style", &self.style)
            .field("remove_stop_words", &self.remove_stop_words)
            .field("max_slug_words", &self.max_slug_words)
            .finish_non_exhaustive()
    }
}

impl PermalinkDeriver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            style: settings.slug_style,
            remove_stop_words: settings.remove_stop_words,
            max_slug_words: settings.max_slug_words,
            translator: Arc::new(BaiduTranslator::from_settings(settings)),
        }
    }

    /// Replace the translation backend.
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    /// Same deriver with a different strategy.
    pub fn with_style(mut self, style: SlugStyle) -> Self {
        self.style = style;
        self
    }

    pub fn style(&self) -> SlugStyle {
        self.style
    }

    /// Permalink for `title`, `""` when the strategy yields nothing.
    pub async fn derive(&self, title: &str) -> String {
        let raw = match self.style {
            SlugStyle::Manual => return String::new(),
            SlugStyle::Hash => content_hash(title)[..8].to_string(),
            SlugStyle::Pinyin => pinyin_initials(title),
            SlugStyle::Title => self.post_process(title),
            SlugStyle::Translate => match self.translator.translate(title).await {
                Ok(translated) if !translated.trim().is_empty() => {
                    self.post_process(&translated)
                }
                Ok(_) => String::new(),
                Err(e) => {
                    tracing::warn!(title, error = %e, "translation failed");
                    String::new()
                }
            },
        };
        normalize(raw)
    }

    fn post_process(&self, text: &str) -> String {
        post_process(text, self.remove_stop_words, self.max_slug_words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedTranslator(Result<&'static str, &'static str>);

    #[async_trait]
    impl Translator for FixedTranslator {
        async fn translate(&self, _text: &str) -> Result<String, TranslateError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(msg) => Err(TranslateError::Malformed(msg.to_string())),
            }
        }
    }

    fn deriver(style: SlugStyle) -> PermalinkDeriver {
        PermalinkDeriver::new(&Settings::default()).with_style(style)
    }

    #[test]
    fn test_sign_matches_md5() {
        // md5("2015063000000001apple143566028812345678")
        assert_eq!(
            sign("2015063000000001", "apple", "1435660288", "12345678"),
            "f89f9594663708c1605f3d736d01d2d4"
        );
    }

    #[test]
    fn test_parse_response_success() {
        let body = json!({"from": "zh", "to": "en", "trans_result": [{"src": "你好", "dst": "Hello"}]});
        assert_eq!(parse_response(&body).unwrap(), "Hello");
    }

    #[test]
    fn test_parse_response_error_code_number_or_string() {
        let body = json!({"error_code": "54001", "error_msg": "Invalid Sign"});
        match parse_response(&body) {
            Err(TranslateError::Remote { code, message }) => {
                assert_eq!(code, "54001");
                assert_eq!(message, "Invalid Sign");
            }
            other => panic!("unexpected {other:?}"),
        }
        let body = json!({"error_code": 52003, "error_msg": "UNAUTHORIZED USER"});
        assert!(matches!(
            parse_response(&body),
            Err(TranslateError::Remote { code, .. }) if code == "52003"
        ));
    }

    #[test]
    fn test_parse_response_malformed() {
        assert!(matches!(
            parse_response(&json!({"trans_result": []})),
            Err(TranslateError::Malformed(_))
        ));
    }

    #[test]
    fn test_post_process() {
        assert_eq!(post_process("The Art of War", true, 5), "art-war");
        assert_eq!(post_process("The Art of War", false, 5), "the-art-of-war");
        assert_eq!(post_process("one two three four five six", false, 3), "one-two-three");
        assert_eq!(post_process("one two three", false, 0), "one-two-three");
        assert_eq!(post_process("Rust 2024: edition!", true, 5), "rust-2024-edition");
        assert_eq!(post_process("the of", true, 5), FALLBACK_SLUG);
        assert_eq!(post_process("中文", true, 5), FALLBACK_SLUG);
    }

    #[test]
    fn test_pinyin_initials() {
        assert_eq!(pinyin_initials("中国"), "zhg");
        assert_eq!(pinyin_initials("你好 World"), "nhworld");
        assert_eq!(pinyin_initials("爱"), FALLBACK_SLUG);
        assert_eq!(pinyin_initials("!!"), FALLBACK_SLUG);
    }

    #[test]
    fn test_syllable_initial() {
        assert_eq!(syllable_initial("zhong"), "zh");
        assert_eq!(syllable_initial("shi"), "sh");
        assert_eq!(syllable_initial("yi"), "y");
        assert_eq!(syllable_initial("wo"), "w");
        assert_eq!(syllable_initial("ai"), "");
        assert_eq!(syllable_initial("er"), "");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(String::new()), "");
        assert_eq!(normalize("abc".into()), "abc/");
        assert_eq!(normalize("abc/".into()), "abc/");
        assert_eq!(normalize("abc.html".into()), "abc.html");
    }

    #[tokio::test]
    async fn test_manual_is_empty() {
        assert_eq!(deriver(SlugStyle::Manual).derive("Anything").await, "");
    }

    #[tokio::test]
    async fn test_hash_is_deterministic() {
        let d = deriver(SlugStyle::Hash);
        let a = d.derive("My Post").await;
        let b = d.derive("My Post").await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 9);
        assert!(a.ends_with('/'));
        assert!(a[..8].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(&a[..8], &content_hash("My Post")[..8]);
    }

    #[tokio::test]
    async fn test_title_style() {
        assert_eq!(
            deriver(SlugStyle::Title).derive("Hello, World").await,
            "hello-world/"
        );
        assert_eq!(deriver(SlugStyle::Title).derive("???").await, "post/");
    }

    #[tokio::test]
    async fn test_translate_uses_translator() {
        let d = deriver(SlugStyle::Translate)
            .with_translator(Arc::new(FixedTranslator(Ok("A Walk in the Park"))));
        assert_eq!(d.derive("公园散步").await, "walk-park/");
    }

    #[tokio::test]
    async fn test_translate_failure_is_empty() {
        let d = deriver(SlugStyle::Translate)
            .with_translator(Arc::new(FixedTranslator(Err("boom"))));
        assert_eq!(d.derive("公园散步").await, "");
    }

    #[tokio::test]
    async fn test_translate_without_credentials_is_empty() {
        let err = BaiduTranslator::new("", "").translate("x").await.unwrap_err();
        assert!(matches!(err, TranslateError::MissingCredentials));
        assert_eq!(deriver(SlugStyle::Translate).derive("公园").await, "");
    }
}
