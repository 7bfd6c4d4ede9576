use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CanonicalError;
use crate::util::unix_now_secs;

#[derive(Debug, thiserror::Error)]
pub enum ModelInfoError {
    #[error("model info source unavailable: {0}")]
    Unavailable(String),
    #[error("no model info for `{0}`")]
    UnknownModel(String),
}

/// External model metadata. Callers treat every failure as "use the
/// fallback"; nothing here ever fails a request.
pub trait ModelInfoSource: Send + Sync {
    /// Models the deployment currently serves.
    ///
    /// # Errors
    ///
    /// Any lookup failure.
    fn available_models(&self) -> Result<Vec<String>, ModelInfoError>;

    /// Largest output budget the model accepts.
    ///
    /// # Errors
    ///
    /// Any lookup failure, including an unknown model.
    fn max_output_tokens(&self, model: &str) -> Result<u64, ModelInfoError>;
}

/// Source backed by a fixed table. Useful for replay and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticModelInfo {
    pub models: Vec<String>,
    pub max_output_tokens: BTreeMap<String, u64>,
}

impl ModelInfoSource for StaticModelInfo {
    fn available_models(&self) -> Result<Vec<String>, ModelInfoError> {
        Ok(self.models.clone())
    }

    fn max_output_tokens(&self, model: &str) -> Result<u64, ModelInfoError> {
        self.max_output_tokens
            .get(model)
            .copied()
            .ok_or_else(|| ModelInfoError::UnknownModel(model.to_string()))
    }
}

struct DynamicModels {
    source: Arc<dyn ModelInfoSource>,
    last_good: RwLock<Option<Arc<[String]>>>,
    ttl_secs: u64,
    next_refresh_unix: AtomicU64,
    refreshing: AtomicBool,
}

impl DynamicModels {
    fn try_begin_refresh(&self, now: u64) -> bool {
        if now < self.next_refresh_unix.load(Ordering::Relaxed) {
            return false;
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.next_refresh_unix
            .store(now.saturating_add(self.ttl_secs), Ordering::Relaxed);
        true
    }

    fn finish_refresh(&self) {
        self.refreshing.store(false, Ordering::Release);
    }

    fn refresh(&self) {
        match self.source.available_models() {
            Ok(models) if !models.is_empty() => {
                *self.last_good.write() = Some(Arc::from(models));
            }
            Ok(_) => tracing::warn!("model info source returned no models; keeping previous allowlist"),
            Err(e) => tracing::warn!(error = %e, "model allowlist refresh failed; keeping previous allowlist"),
        }
    }
}

/// Resolves a requested model name against one target's allowlist.
///
/// Names are normalized (trimmed, `models/` prefix dropped, lowercased),
/// then mapped through the alias table, then matched exactly or by version
/// suffix. An empty allowlist accepts any name.
pub struct ModelResolver {
    static_models: Arc<[String]>,
    aliases: BTreeMap<String, String>,
    dynamic: Option<DynamicModels>,
}

impl ModelResolver {
    #[must_use]
    pub fn new(models: Vec<String>, aliases: &BTreeMap<String, String>) -> Self {
        Self {
            static_models: Arc::from(models),
            aliases: aliases
                .iter()
                .map(|(alias, target)| (normalize_model_name(alias), target.trim().to_string()))
                .collect(),
            dynamic: None,
        }
    }

    /// Refresh the allowlist from `source` at most once per `ttl_secs`.
    #[must_use]
    pub fn with_dynamic_source(mut self, source: Arc<dyn ModelInfoSource>, ttl_secs: u64) -> Self {
        self.dynamic = Some(DynamicModels {
            source,
            last_good: RwLock::new(None),
            ttl_secs,
            next_refresh_unix: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
        });
        self
    }

    /// Current allowlist: the last good dynamic list, else the static one.
    #[must_use]
    pub fn allowlist(&self) -> Arc<[String]> {
        if let Some(dynamic) = &self.dynamic {
            if dynamic.try_begin_refresh(unix_now_secs()) {
                dynamic.refresh();
                dynamic.finish_refresh();
            }
            if let Some(models) = dynamic.last_good.read().as_ref() {
                return Arc::clone(models);
            }
        }
        Arc::clone(&self.static_models)
    }

    /// Resolve `requested` to the allowlisted name to send to the backend.
    ///
    /// # Errors
    ///
    /// [`CanonicalError::UnsupportedModel`] listing the current allowlist
    /// when nothing matches.
    pub fn resolve(&self, requested: &str) -> Result<String, CanonicalError> {
        let normalized = normalize_model_name(requested);
        let target = match self.aliases.get(&normalized) {
            Some(aliased) => {
                tracing::debug!(requested, resolved = %aliased, "model alias applied");
                aliased.clone()
            }
            None => requested.trim().to_string(),
        };

        let allowlist = self.allowlist();
        if allowlist.is_empty() {
            return Ok(target);
        }
        match match_allowlisted(&normalize_model_name(&target), &allowlist) {
            Some(found) => Ok(found.to_string()),
            None => Err(CanonicalError::UnsupportedModel {
                requested: requested.to_string(),
                available: allowlist.to_vec(),
            }),
        }
    }
}

#[must_use]
pub fn normalize_model_name(name: &str) -> String {
    let trimmed = name.trim();
    let stripped = trimmed.strip_prefix("models/").unwrap_or(trimmed);
    stripped.to_ascii_lowercase()
}

/// `-latest`, or `-` followed by a dated/numbered version (`-20241022`,
/// `-2024-08-06`, `-001`).
fn is_version_suffix(rest: &str) -> bool {
    let Some(body) = rest.strip_prefix('-') else {
        return false;
    };
    if body == "latest" {
        return true;
    }
    body.starts_with(|c: char| c.is_ascii_digit())
        && body.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '.')
}

fn match_allowlisted<'a>(requested: &str, allowlist: &'a [String]) -> Option<&'a str> {
    let normalized: Vec<(String, &str)> = allowlist
        .iter()
        .map(|entry| (normalize_model_name(entry), entry.as_str()))
        .collect();

    if let Some((_, entry)) = normalized.iter().find(|(n, _)| n == requested) {
        return Some(entry);
    }
    // requested pins a version of an allowlisted family
    if let Some((_, entry)) = normalized.iter().find(|(n, _)| {
        requested
            .strip_prefix(n.as_str())
            .is_some_and(is_version_suffix)
    }) {
        return Some(entry);
    }
    // requested names a family; newest allowlisted version wins
    normalized
        .iter()
        .filter(|(n, _)| n.strip_prefix(requested).is_some_and(is_version_suffix))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, entry)| *entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn aliases() -> BTreeMap<String, String> {
        BTreeMap::from([("sonnet".to_string(), "claude-sonnet-4-5".to_string())])
    }

    fn resolver() -> ModelResolver {
        ModelResolver::new(
            vec![
                "claude-sonnet-4-5-20250929".into(),
                "claude-sonnet-4-5-20250101".into(),
                "gpt-4o".into(),
            ],
            &aliases(),
        )
    }

    #[test]
    fn alias_resolves_to_newest_version() {
        assert_eq!(resolver().resolve("Sonnet").unwrap(), "claude-sonnet-4-5-20250929");
    }

    #[test]
    fn exact_and_pinned_versions_match() {
        let r = resolver();
        assert_eq!(r.resolve(" models/GPT-4o ").unwrap(), "gpt-4o");
        assert_eq!(r.resolve("gpt-4o-2024-08-06").unwrap(), "gpt-4o");
        assert!(r.resolve("gpt-4o-mini").is_err());
    }

    #[test]
    fn unknown_model_lists_allowlist() {
        let err = resolver().resolve("llama-3").unwrap_err();
        let CanonicalError::UnsupportedModel { requested, available } = err else {
            panic!("expected UnsupportedModel");
        };
        assert_eq!(requested, "llama-3");
        assert_eq!(available.len(), 3);
    }

    #[test]
    fn empty_allowlist_accepts_anything() {
        let r = ModelResolver::new(Vec::new(), &BTreeMap::new());
        assert_eq!(r.resolve(" Anything-Goes").unwrap(), "Anything-Goes");
    }

    struct FlakySource {
        calls: Mutex<u32>,
    }

    impl ModelInfoSource for FlakySource {
        fn available_models(&self) -> Result<Vec<String>, ModelInfoError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls == 1 {
                Ok(vec!["dyn-model".to_string()])
            } else {
                Err(ModelInfoError::Unavailable("down".into()))
            }
        }

        fn max_output_tokens(&self, model: &str) -> Result<u64, ModelInfoError> {
            Err(ModelInfoError::UnknownModel(model.into()))
        }
    }

    #[test]
    fn refresh_failure_keeps_last_known_good() {
        let r = ModelResolver::new(vec!["static-model".into()], &BTreeMap::new())
            .with_dynamic_source(Arc::new(FlakySource { calls: Mutex::new(0) }), 0);
        assert_eq!(r.resolve("dyn-model").unwrap(), "dyn-model");
        // second refresh fails; the dynamic list survives
        assert_eq!(r.resolve("dyn-model").unwrap(), "dyn-model");
        assert!(r.resolve("static-model").is_err());
    }

    #[test]
    fn failing_source_falls_back_to_static_list() {
        let source = Arc::new(FlakySource { calls: Mutex::new(1) });
        let r = ModelResolver::new(vec!["static-model".into()], &BTreeMap::new())
            .with_dynamic_source(source, 60);
        assert_eq!(r.resolve("static-model").unwrap(), "static-model");
    }
}
