use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Provider account family a key can be bound to.
///
/// The resolver's fixed fallback order is `PRIORITY`; keep it in sync when
/// adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountKind {
    Claude,
    ClaudeConsole,
    Bedrock,
    Gemini,
    Openai,
}

impl AccountKind {
    /// Fixed priority order used when nothing else narrows the candidates.
    pub const PRIORITY: [AccountKind; 5] = [
        AccountKind::Claude,
        AccountKind::ClaudeConsole,
        AccountKind::Bedrock,
        AccountKind::Gemini,
        AccountKind::Openai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Claude => "claude",
            AccountKind::ClaudeConsole => "claude-console",
            AccountKind::Bedrock => "bedrock",
            AccountKind::Gemini => "gemini",
            AccountKind::Openai => "openai",
        }
    }

    /// Kind-specific prefix some collaborators prepend to raw account ids.
    ///
    /// `"claude-console:abc123"` declares a ClaudeConsole account `abc123`.
    pub fn id_prefix(&self) -> String {
        format!("{}:", self.as_str())
    }

    /// Candidate families inferred from a model name.
    ///
    /// Returns an empty slice when the model name implies nothing.
    pub fn infer_from_model(model: &str) -> &'static [AccountKind] {
        let model = model.to_ascii_lowercase();
        if model.contains("claude") {
            &[
                AccountKind::Claude,
                AccountKind::ClaudeConsole,
                AccountKind::Bedrock,
            ]
        } else if model.contains("gemini") {
            &[AccountKind::Gemini]
        } else if model.starts_with("gpt") || model.starts_with("o1") || model.contains("codex") {
            &[AccountKind::Openai]
        } else {
            &[]
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AccountKind::Claude),
            "claude-console" => Ok(AccountKind::ClaudeConsole),
            "bedrock" => Ok(AccountKind::Bedrock),
            "gemini" => Ok(AccountKind::Gemini),
            "openai" => Ok(AccountKind::Openai),
            _ => Err(format!("Unknown account kind '{s}'")),
        }
    }
}

/// Raw account record returned by a provider's account registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    /// Registry-specific grouping (e.g. "shared", "dedicated")
    pub category: Option<String>,
}

impl AccountProfile {
    /// Best human-readable label for this account.
    ///
    /// Falls through name, display name, email, username, then the raw id.
    pub fn label(&self) -> &str {
        [
            self.name.as_deref(),
            self.display_name.as_deref(),
            self.email.as_deref(),
            self.username.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .unwrap_or(&self.id)
    }
}

/// Ephemeral output of the account resolver. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAccountInfo {
    pub account_id: String,
    pub account_kind: AccountKind,
    pub account_category: Option<String>,
    pub display_name: String,
}

/// Resolution result: either a live account or the deleted sentinel.
///
/// `Deleted` means the account existed historically (a usage record names
/// it) but no registry knows it now. Callers render it distinctly from
/// "unknown"; the resolver never returns null or panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolvedAccount {
    Found(ResolvedAccountInfo),
    Deleted,
}
