//! Locale catalogs and phrase translation.
//!
//! Catalogs are JSON files named `<locale>.json` in one directory. Nested
//! objects flatten to dotted keys (`{"action": {"added": ..}}` is
//! `action.added`). Phrases interpolate `%{name}` and pick a plural form
//! from `||||`-separated variants by `smart_count`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ViewError;
use crate::memo::AsyncMemo;

const PLURAL_SEPARATOR: &str = "||||";

fn interpolation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\{(.*?)\}").unwrap())
}

/// Language part of a `LANG`-style value: `de_DE.UTF-8` is `de`.
pub fn language_from_env(lang: &str) -> Option<String> {
    let language = lang.split(['.', '_']).next().unwrap_or_default();
    (!language.is_empty()).then(|| language.to_string())
}

/// Locales of an `Accept-Language` header, most preferred first.
/// Wildcards are skipped; equal weights keep header order.
pub fn parse_accept_language(header: &str) -> Vec<String> {
    let mut ranked: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let locale = parts.next()?.trim();
            if locale.is_empty() || locale == "*" {
                return None;
            }
            let quality = parts
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((locale.to_string(), quality))
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.into_iter().map(|(locale, _)| locale).collect()
}

/// Plural form index for `count` under `locale`'s rules.
fn plural_index(locale: &str, count: i64) -> usize {
    let language = locale
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let n = count.unsigned_abs();
    match language.as_str() {
        "ja" | "ko" | "zh" | "th" | "id" | "ms" | "vi" | "fa" | "tr" => 0,
        "fr" | "pt" | "hy" => usize::from(n > 1),
        "ru" | "uk" | "be" | "sr" | "hr" | "bs" => {
            let (m10, m100) = (n % 10, n % 100);
            if m10 == 1 && m100 != 11 {
                0
            } else if (2..=4).contains(&m10) && !(12..=14).contains(&m100) {
                1
            } else {
                2
            }
        }
        "pl" => {
            let (m10, m100) = (n % 10, n % 100);
            if n == 1 {
                0
            } else if (2..=4).contains(&m10) && !(12..=14).contains(&m100) {
                1
            } else {
                2
            }
        }
        "cs" | "sk" => match n {
            1 => 0,
            2..=4 => 1,
            _ => 2,
        },
        _ => usize::from(n != 1),
    }
}

/// Phrases of one locale.
#[derive(Debug, Clone, PartialEq)]
pub struct Translator {
    locale: String,
    phrases: BTreeMap<String, String>,
}

impl Translator {
    /// Build a translator from a parsed catalog.
    pub fn from_json(locale: impl Into<String>, catalog: &Value) -> Result<Self, ViewError> {
        let locale = locale.into();
        let Value::Object(_) = catalog else {
            return Err(ViewError::malformed(format!(
                "catalog {} is not a JSON object",
                locale
            )));
        };
        let mut phrases = BTreeMap::new();
        flatten("", catalog, &mut phrases);
        Ok(Self { locale, phrases })
    }

    /// Locale used for dates and numbers.
    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn has(&self, key: &str) -> bool {
        self.phrases.contains_key(key)
    }

    /// Phrase for `key`, or the key itself when the catalog lacks it.
    pub fn t(&self, key: &str) -> String {
        self.t_with(key, &[])
    }

    /// Phrase for `key` with `%{name}` placeholders filled from `args`.
    pub fn t_with(&self, key: &str, args: &[(&str, &str)]) -> String {
        match self.phrases.get(key) {
            Some(phrase) => interpolate(phrase, args, None),
            None => key.to_string(),
        }
    }

    /// Plural-aware phrase; `%{smart_count}` expands to `count`.
    pub fn t_count(&self, key: &str, count: i64, args: &[(&str, &str)]) -> String {
        let Some(phrase) = self.phrases.get(key) else {
            return key.to_string();
        };
        let forms: Vec<&str> = phrase.split(PLURAL_SEPARATOR).collect();
        let index = plural_index(&self.locale, count).min(forms.len() - 1);
        interpolate(forms[index].trim(), args, Some(count))
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&key, value, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Null => {}
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

fn interpolate(phrase: &str, args: &[(&str, &str)], count: Option<i64>) -> String {
    interpolation_re()
        .replace_all(phrase, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if name == "smart_count"
                && let Some(count) = count
            {
                return count.to_string();
            }
            args.iter()
                .find(|(arg, _)| *arg == name)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Memoized catalog loader with the locale fallback chain.
#[derive(Clone)]
pub struct Catalogs {
    dir: PathBuf,
    fallback: String,
    default_language: Option<String>,
    memo: AsyncMemo<String, Option<Arc<Translator>>>,
}

impl Catalogs {
    /// Catalogs in `dir`, with `fallback` as the last resort locale.
    pub fn new(dir: impl Into<PathBuf>, fallback: impl Into<String>) -> Self {
        let dir = dir.into();
        let load_dir = dir.clone();
        let memo = AsyncMemo::new("catalogs", move |locale: String| {
            let path = load_dir.join(format!("{}.json", locale));
            async move { load_catalog(path, locale).await }
        });
        Self {
            dir,
            fallback: fallback.into(),
            default_language: None,
            memo,
        }
    }

    /// Process default language, tried after the request's preferences.
    pub fn with_default_language(mut self, language: Option<String>) -> Self {
        self.default_language = language;
        self
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Catalog for `locale`; `None` when there is no such file.
    pub async fn get_catalog(&self, locale: &str) -> Result<Option<Arc<Translator>>, ViewError> {
        let locale = locale.replace('/', "");
        if locale.is_empty() {
            return Ok(None);
        }
        self.memo.get(locale).await
    }

    /// Pick a catalog for a request: the explicit locale, then the
    /// `Accept-Language` preferences, then the default language, then the
    /// fallback. A malformed catalog stops the search.
    pub async fn pick_catalog(
        &self,
        accept_language: Option<&str>,
        explicit: Option<&str>,
    ) -> Result<Arc<Translator>, ViewError> {
        let mut candidates: Vec<String> = explicit.into_iter().map(str::to_string).collect();
        candidates.extend(accept_language.map(parse_accept_language).unwrap_or_default());
        candidates.extend(self.default_language.clone());
        candidates.push(self.fallback.clone());

        for locale in &candidates {
            if let Some(translator) = self.get_catalog(locale).await? {
                debug!(locale = %translator.locale(), "i18n: picked catalog");
                return Ok(translator);
            }
        }
        warn!(tried = ?candidates, "i18n: no catalog found");
        Err(ViewError::not_found(format!(
            "no catalog for any of {}",
            candidates.join(", ")
        )))
    }

    /// Locales with a catalog file, sorted.
    pub async fn list_locales(&self) -> Result<Vec<String>, ViewError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ViewError::not_found(format!("{}: {}", self.dir.display(), e)))?;
        let mut locales = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ViewError::malformed(e.to_string()))?
        {
            if let Some(locale) = entry.file_name().to_string_lossy().strip_suffix(".json") {
                locales.push(locale.to_string());
            }
        }
        locales.sort();
        Ok(locales)
    }
}

async fn load_catalog(path: PathBuf, locale: String) -> Result<Option<Arc<Translator>>, ViewError> {
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(locale = %locale, "i18n: no catalog file");
            return Ok(None);
        }
        Err(e) => {
            return Err(ViewError::malformed(format!("{}: {}", path.display(), e)));
        }
    };
    let catalog: Value = serde_json::from_slice(&data)
        .map_err(|e| ViewError::malformed(format!("{}: {}", path.display(), e)))?;
    let translator = Translator::from_json(locale, &catalog)?;
    debug!(locale = %translator.locale(), phrases = translator.phrases.len(), "i18n: catalog loaded");
    Ok(Some(Arc::new(translator)))
}
