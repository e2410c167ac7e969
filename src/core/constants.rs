//! Shared constants used across the application

/// Default completion endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.llm7.io/v1";

/// Model selected when no persisted or CLI choice exists.
pub const DEFAULT_MODEL: &str = "deepseek-r1-0528";

/// Sentinel credential sent when the user has not supplied one. The service
/// tier is decided server-side by the presence of a real token.
pub const UNUSED_CREDENTIAL: &str = "unused";

/// Upper bound on stored sessions; least-recently-updated are evicted.
pub const MAX_SESSIONS: usize = 50;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Placeholder title assigned to freshly created sessions.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Superseding auto-save requests within this window collapse to one.
pub const SAVE_DEBOUNCE_MS: u64 = 1000;

/// Debounce window for AI title synthesis.
pub const TITLE_DEBOUNCE_MS: u64 = 2000;

/// Fast, cheap model used for title synthesis only.
pub const TITLE_MODEL: &str = "gpt-4o-mini";
pub const TITLE_TEMPERATURE: f64 = 0.3;
pub const TITLE_MAX_TOKENS: u32 = 20;

/// Synthesized titles are truncated to this many characters.
pub const TITLE_MAX_CHARS: usize = 60;

/// Heuristic fallback titles are truncated to this many characters.
pub const FALLBACK_TITLE_MAX_CHARS: usize = 50;
