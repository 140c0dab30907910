//! Adapter registry: the process-wide adapter table, the shared
//! availability cache, and the canonical-model mapping.

use std::collections::HashMap;
use std::time::Duration;

use overture_events::AgentKind;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::adapters::{claude, codex, cursor, gemini, qwen, Adapter, Availability};

/// Outcome of mapping a canonical model name to the native flag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResolution {
    pub native: Option<String>,
    /// True when the canonical name was unknown and the adapter default
    /// was substituted.
    pub fell_back: bool,
}

pub struct AdapterRegistry {
    adapters: HashMap<AgentKind, Adapter>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<AgentKind, (Instant, Availability)>>,
}

impl AdapterRegistry {
    /// Registry over the default CLI binaries.
    pub fn new(cache_ttl: Duration) -> Self {
        Self::with_adapters(Vec::new(), cache_ttl)
    }

    /// Registry with specific adapter instances; kinds not supplied get
    /// their default driver. Tests use this to point adapters at
    /// scripted fixtures.
    pub fn with_adapters(adapters: Vec<Adapter>, cache_ttl: Duration) -> Self {
        let mut map: HashMap<AgentKind, Adapter> = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();
        for kind in AgentKind::ALL {
            map.entry(kind).or_insert_with(|| Adapter::default_for(kind));
        }
        Self {
            adapters: map,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, kind: AgentKind) -> Adapter {
        self.adapters
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Adapter::default_for(kind))
    }

    pub fn list(&self) -> Vec<AgentKind> {
        AgentKind::ALL.to_vec()
    }

    /// Cached availability probe for one agent.
    pub async fn availability(&self, kind: AgentKind) -> Availability {
        {
            let cache = self.cache.lock().await;
            if let Some((probed_at, availability)) = cache.get(&kind) {
                if probed_at.elapsed() < self.cache_ttl {
                    return availability.clone();
                }
            }
        }

        let fresh = self.get(kind).available().await;
        self.cache
            .lock()
            .await
            .insert(kind, (Instant::now(), fresh.clone()));
        fresh
    }

    /// Probe all agents, sharing the cache. Feeds the status grid.
    pub async fn availability_snapshot(&self) -> HashMap<AgentKind, Availability> {
        let probes = AgentKind::ALL.map(|kind| async move { (kind, self.availability(kind).await) });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    pub fn default_model(&self, kind: AgentKind) -> String {
        Adapter::default_model(kind).to_string()
    }

    /// Map a canonical model name to the native flag value. `None` picks
    /// the adapter default; an unknown name falls back to the default
    /// with `fell_back` set so the caller can emit the warning event.
    pub fn resolve_model(&self, kind: AgentKind, canonical: Option<&str>) -> ModelResolution {
        match canonical {
            None => ModelResolution {
                native: Some(self.default_model(kind)),
                fell_back: false,
            },
            Some(name) => match lookup(kind, name) {
                Some(native) => ModelResolution {
                    native: Some(native.to_string()),
                    fell_back: false,
                },
                None => ModelResolution {
                    native: Some(self.default_model(kind)),
                    fell_back: true,
                },
            },
        }
    }
}

fn lookup(kind: AgentKind, canonical: &str) -> Option<&'static str> {
    canonical_table(kind)
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, native)| *native)
}

/// (canonical name, native flag value) per agent. Native ids map to
/// themselves so callers may pass either spelling.
fn canonical_table(kind: AgentKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        AgentKind::Claude => &[
            ("claude-sonnet-4.5", claude::DEFAULT_MODEL),
            ("claude-opus-4.1", "claude-opus-4-1-20250805"),
            ("claude-haiku-4.5", "claude-haiku-4-5-20251001"),
            ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5-20250929"),
            ("claude-opus-4-1-20250805", "claude-opus-4-1-20250805"),
            ("claude-haiku-4-5-20251001", "claude-haiku-4-5-20251001"),
        ],
        AgentKind::Cursor => &[
            ("auto", cursor::DEFAULT_MODEL),
            ("sonnet-4.5", "sonnet-4.5"),
            ("opus-4.1", "opus-4.1"),
            ("gpt-5", "gpt-5"),
        ],
        AgentKind::Codex => &[
            ("gpt-5-codex", codex::DEFAULT_MODEL),
            ("gpt-5", "gpt-5"),
            ("gpt-5.3-codex", "gpt-5.3-codex"),
        ],
        AgentKind::Gemini => &[
            ("gemini-2.5-pro", gemini::DEFAULT_MODEL),
            ("gemini-2.5-flash", "gemini-2.5-flash"),
        ],
        AgentKind::Qwen => &[
            ("qwen3-coder-plus", qwen::DEFAULT_MODEL),
            ("qwen3-coder-flash", "qwen3-coder-flash"),
        ],
    }
}
