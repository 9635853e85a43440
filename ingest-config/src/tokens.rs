use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client token, either the plain string form or the object form with
/// allowed origins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Token {
    Plain(String),
    WithOrigins {
        token: String,
        #[serde(default)]
        origins: Vec<String>,
    },
}

impl Token {
    pub fn id(&self) -> &str {
        match self {
            Token::Plain(token) => token,
            Token::WithOrigins { token, .. } => token,
        }
    }

    pub fn origins(&self) -> &[String] {
        match self {
            Token::Plain(_) => &[],
            Token::WithOrigins { origins, .. } => origins,
        }
    }
}

/// Token registry with the two token classes: `js` (browser) and `api`
/// (server-to-server).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokensConfig {
    #[serde(default)]
    pub js: Vec<Token>,
    #[serde(default)]
    pub api: Vec<Token>,
}

impl TokensConfig {
    /// All token ids of both classes, with whitespace-trimmed ids and empty
    /// ids dropped, mapped to their allowed origins.
    pub fn all(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        for token in self.js.iter().chain(self.api.iter()) {
            let id = token.id().trim();
            if !id.is_empty() {
                out.insert(id.to_owned(), token.origins().to_vec());
            }
        }
        out
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.js
            .iter()
            .chain(self.api.iter())
            .any(|token| token.id().trim() == token_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_token_forms_parse() {
        let json = r#"{
            "js": ["plain-token", {"token": "obj-token", "origins": ["example.com"]}],
            "api": ["server-token"]
        }"#;
        let cfg: TokensConfig = serde_json::from_str(json).unwrap();

        let all = cfg.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all["obj-token"], vec!["example.com".to_owned()]);
        assert!(all["plain-token"].is_empty());
        assert!(cfg.contains("server-token"));
        assert!(!cfg.contains("unknown"));
    }

    #[test]
    fn blank_tokens_are_dropped() {
        let cfg: TokensConfig = serde_json::from_str(r#"{"js": ["  ", "ok"]}"#).unwrap();
        assert_eq!(cfg.all().len(), 1);
    }
}
