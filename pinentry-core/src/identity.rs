//! Mapping from the hints gpg-agent gives us (`SETKEYINFO`, `SETDESC`) to a
//! configured identity name.
//!
//! A hint is resolved by, in order: the in-memory cache, a scan of the
//! configuration, and finally the identity CLI (keygrips only). Anything that
//! resolves outside the cache is written back into it. Failing to resolve is
//! not an error; the caller simply falls back to the interactive prompt.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::IdentityCli;
use crate::assuan::percent_decode;
use crate::config::Config;
use crate::state::SessionState;

static KEYGRIP_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        // Smartcard: s/<serial>/<keygrip>
        Regex::new(r"(?i)s/[^/]+/([0-9a-f]{40})").expect("static regex"),
        // Regular key: n/<keygrip>
        Regex::new(r"(?i)n/([0-9a-f]{40})").expect("static regex"),
        Regex::new(r"(?i)([0-9a-f]{40})").expect("static regex"),
    ]
});

static KEY_ID_PATTERNS: LazyLock<[Regex; 5]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)key\s+([0-9a-f]{16})").expect("static regex"),
        Regex::new(r"(?i)key\s+([0-9a-f]{8})").expect("static regex"),
        Regex::new(r"(?i)Key ID:\s*([0-9a-f]{8,16})").expect("static regex"),
        Regex::new(r"(?i)Smartcard\s+([0-9a-f]{8,16})").expect("static regex"),
        Regex::new(r"(?i)0x([0-9a-f]{8,16})").expect("static regex"),
    ]
});

static BARE_KEY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([0-9a-f]{16})").expect("static regex"));

const KEYGRIP_LEN: usize = 40;

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Upper-cased keygrip from a `SETKEYINFO` argument.
pub fn extract_keygrip(keyinfo: &str) -> Option<String> {
    if keyinfo.is_empty() {
        return None;
    }
    first_capture(&*KEYGRIP_PATTERNS, keyinfo)
}

/// `SETDESC` arrives percent-encoded (`%0A` for line breaks); patterns run
/// over the text as displayed.
fn readable(description: &str) -> String {
    String::from_utf8_lossy(&percent_decode(description.as_bytes())).into_owned()
}

/// Upper-cased key ID from a `SETDESC` argument such as
/// `Please enter the PIN for key 8547785CA25F0AA8`.
pub fn extract_key_id(description: &str) -> Option<String> {
    if description.is_empty() {
        return None;
    }
    first_capture(&*KEY_ID_PATTERNS, &readable(description))
}

/// Best single hint for `state`: keygrip, then key ID, then any 16-hex token
/// in the description and key info.
pub fn identity_hint(state: &SessionState) -> Option<String> {
    extract_keygrip(&state.keyinfo)
        .or_else(|| extract_key_id(&state.description))
        .or_else(|| {
            let text = format!("{} {}", readable(&state.description), state.keyinfo);
            first_capture(std::slice::from_ref(&*BARE_KEY_ID), &text)
        })
}

/// Whether CLI output looks like an identity name rather than a message:
/// one token, no ANSI escapes, no brackets, no "error".
pub fn plausible_identity_name(output: &str) -> Option<&str> {
    let name = output.trim();
    let acceptable = !name.is_empty()
        && !name.contains(char::is_whitespace)
        && !name.contains(['[', ']'])
        && !name.contains('\u{1b}')
        && !name.to_ascii_uppercase().contains("ERROR");
    acceptable.then_some(name)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Upper-cased keygrip or key ID → identity name. Lives as long as the
/// process; never holds secrets.
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    entries: HashMap<String, String>,
}

impl IdentityCache {
    /// Seed with every keygrip and primary key ID in `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut cache = Self::default();
        for identity in config.identities() {
            for keygrip in identity.keygrips {
                cache.insert(keygrip, identity.name);
            }
            if let Some(key_id) = identity.key_id {
                cache.insert(key_id, identity.name);
            }
        }
        cache
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, identity: &str) {
        self.entries
            .insert(key.to_ascii_uppercase(), identity.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

fn key_ids_match(configured: &str, candidate: &str) -> bool {
    let configured = configured.to_ascii_uppercase();
    configured == candidate || configured.ends_with(candidate) || candidate.ends_with(&configured)
}

/// Resolves protocol hints against the cache, the configuration and the CLI.
pub struct IdentityResolver<'a> {
    config: &'a Config,
    cache: &'a mut IdentityCache,
    cli: &'a dyn IdentityCli,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(config: &'a Config, cache: &'a mut IdentityCache, cli: &'a dyn IdentityCli) -> Self {
        Self { config, cache, cli }
    }

    /// Resolve the identity that owns the key `state` refers to. Tries the
    /// keygrip, then the key ID from the description, then any bare hint.
    pub async fn resolve(&mut self, state: &SessionState) -> Option<String> {
        let keygrip = extract_keygrip(&state.keyinfo);
        let key_id = extract_key_id(&state.description);

        let mut tried = Vec::with_capacity(3);
        for candidate in [keygrip, key_id].into_iter().flatten() {
            if let Some(name) = self.resolve_key(&candidate).await {
                return Some(name);
            }
            tried.push(candidate);
        }

        let hint = identity_hint(state)?;
        if tried.contains(&hint) {
            return None;
        }
        self.resolve_key(&hint).await
    }

    /// Resolve one keygrip or key ID.
    pub async fn resolve_key(&mut self, key: &str) -> Option<String> {
        let key = key.to_ascii_uppercase();

        if let Some(name) = self.cache.get(&key) {
            return Some(name.to_string());
        }

        if let Some(name) = self.scan_config(&key) {
            tracing::debug!(identity = %name, "config matched {}...", preview(&key));
            self.cache.insert(&key, &name);
            return Some(name);
        }

        if key.len() == KEYGRIP_LEN
            && let Some(name) = self.cli.keygrip_to_identity(&key).await
        {
            tracing::debug!(identity = %name, "CLI resolved keygrip {}...", preview(&key));
            self.cache.insert(&key, &name);
            return Some(name);
        }

        None
    }

    fn scan_config(&self, key: &str) -> Option<String> {
        self.config
            .identities()
            .find(|identity| {
                identity
                    .keygrips
                    .iter()
                    .any(|kg| kg.eq_ignore_ascii_case(key))
                    || identity
                        .key_id
                        .is_some_and(|configured| key_ids_match(configured, key))
            })
            .map(|identity| identity.name.to_string())
    }
}

fn preview(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Pin;

    const GRIP_A: &str = "0123456789ABCDEF0123456789ABCDEF01234567";
    const GRIP_B: &str = "FEDCBA9876543210FEDCBA9876543210FEDCBA98";

    #[derive(Default)]
    struct RecordingCli {
        answer: Option<String>,
        lookups: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl IdentityCli for RecordingCli {
        async fn keygrip_to_identity(&self, keygrip: &str) -> Option<String> {
            self.lookups.lock().unwrap().push(keygrip.to_string());
            self.answer.clone()
        }

        async fn unseal_pin(&self, _identity: &str) -> Option<Pin> {
            None
        }
    }

    fn config() -> Config {
        Config::from_json(&format!(
            r#"{{ "identities": {{
                "personal": {{ "gpg": {{ "keyId": "8547785CA25F0AA8", "keygrips": ["{GRIP_A}"] }} }},
                "work": {{ "gpg": {{ "keyId": "1122334455667788" }} }}
            }} }}"#
        ))
        .unwrap()
    }

    fn state(keyinfo: &str, description: &str) -> SessionState {
        SessionState {
            keyinfo: keyinfo.to_string(),
            description: description.to_string(),
            ..SessionState::default()
        }
    }

    #[test]
    fn smartcard_keygrip_wins() {
        let keyinfo = format!("s/D2760001240103040006/{GRIP_B} {GRIP_A}");
        assert_eq!(extract_keygrip(&keyinfo), Some(GRIP_B.to_string()));
        assert_eq!(
            extract_keygrip(&format!("n/{}", GRIP_A.to_lowercase())),
            Some(GRIP_A.to_string())
        );
        assert_eq!(extract_keygrip(GRIP_B), Some(GRIP_B.to_string()));
        assert_eq!(extract_keygrip("n/ABC"), None);
        assert_eq!(extract_keygrip(""), None);
    }

    #[test]
    fn smartcard_keygrip_beats_description() {
        let s = state(
            &format!("s/ABCD/{GRIP_B}"),
            &format!("Please unlock {GRIP_A}"),
        );
        assert_eq!(identity_hint(&s), Some(GRIP_B.to_string()));
    }

    #[test]
    fn key_id_patterns_apply_in_order() {
        assert_eq!(
            extract_key_id("PIN for key 8547785CA25F0AA8"),
            Some("8547785CA25F0AA8".to_string())
        );
        // The long form is tried first even when the short phrase comes first.
        assert_eq!(
            extract_key_id("key ABCD1234 and key 8547785ca25f0aa8"),
            Some("8547785CA25F0AA8".to_string())
        );
        assert_eq!(extract_key_id("key ABCD1234"), Some("ABCD1234".to_string()));
        assert_eq!(
            extract_key_id("Key ID: 0AA8BEEF12"),
            Some("0AA8BEEF12".to_string())
        );
        assert_eq!(
            extract_key_id("Smartcard 12345678 inserted"),
            Some("12345678".to_string())
        );
        assert_eq!(extract_key_id("id 0xCAFEBABE"), Some("CAFEBABE".to_string()));
        assert_eq!(extract_key_id("no hints here"), None);
    }

    #[test]
    fn bare_sixteen_hex_is_last_resort() {
        let s = state("", "Unlock 8547785ca25f0aa8 please");
        assert_eq!(identity_hint(&s), Some("8547785CA25F0AA8".to_string()));
        assert_eq!(identity_hint(&state("", "nothing")), None);
    }

    #[test]
    fn encoded_description_is_decoded_before_matching() {
        // A %0A escape must not merge its hex digits into the key ID.
        let s = state("", "Unlock key:%0ADEADBEEFCAFEBABE");
        assert_eq!(identity_hint(&s), Some("DEADBEEFCAFEBABE".to_string()));

        assert_eq!(
            extract_key_id("Please enter the PIN%0Afor key%0A8547785CA25F0AA8"),
            Some("8547785CA25F0AA8".to_string())
        );
        assert_eq!(
            extract_key_id("Smartcard%2012345678"),
            Some("12345678".to_string())
        );
    }

    #[test]
    fn filters_cli_noise() {
        assert_eq!(plausible_identity_name("personal\n"), Some("personal"));
        assert_eq!(plausible_identity_name("gitlab-work"), Some("gitlab-work"));
        assert_eq!(plausible_identity_name(""), None);
        assert_eq!(plausible_identity_name("[INFO] personal"), None);
        assert_eq!(plausible_identity_name("personal[1]"), None);
        assert_eq!(plausible_identity_name("work]"), None);
        assert_eq!(plausible_identity_name("\u{1b}[31mpersonal"), None);
        assert_eq!(plausible_identity_name("Error: not found"), None);
        assert_eq!(plausible_identity_name("two words"), None);
    }

    #[test]
    fn cache_is_seeded_from_config() {
        let cache = IdentityCache::from_config(&config());
        assert_eq!(cache.get(&GRIP_A.to_lowercase()), Some("personal"));
        assert_eq!(cache.get("8547785ca25f0aa8"), Some("personal"));
        assert_eq!(cache.get("1122334455667788"), Some("work"));
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn cache_hit_skips_config_and_cli() {
        let config = Config::default();
        let mut cache = IdentityCache::default();
        cache.insert(GRIP_B, "cached");
        let cli = RecordingCli {
            answer: Some("from-cli".to_string()),
            ..RecordingCli::default()
        };

        let mut resolver = IdentityResolver::new(&config, &mut cache, &cli);
        let found = resolver.resolve(&state(&format!("n/{GRIP_B}"), "")).await;
        assert_eq!(found.as_deref(), Some("cached"));
        assert!(cli.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_key_id_matches_by_suffix_and_is_cached() {
        let config = config();
        let mut cache = IdentityCache::default();
        let cli = RecordingCli::default();

        let found = IdentityResolver::new(&config, &mut cache, &cli)
            .resolve(&state("", "PIN for key A25F0AA8"))
            .await;
        assert_eq!(found.as_deref(), Some("personal"));
        assert_eq!(cache.get("A25F0AA8"), Some("personal"));
        assert!(cli.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cli_resolves_unknown_keygrip_and_is_cached() {
        let config = config();
        let mut cache = IdentityCache::default();
        let cli = RecordingCli {
            answer: Some("laptop".to_string()),
            ..RecordingCli::default()
        };

        let found = IdentityResolver::new(&config, &mut cache, &cli)
            .resolve(&state(&format!("n/{GRIP_B}"), ""))
            .await;
        assert_eq!(found.as_deref(), Some("laptop"));
        assert_eq!(cache.get(GRIP_B), Some("laptop"));
        assert_eq!(*cli.lookups.lock().unwrap(), vec![GRIP_B.to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_key_id_when_keygrip_is_unknown() {
        let config = config();
        let mut cache = IdentityCache::default();
        let cli = RecordingCli::default();

        let found = IdentityResolver::new(&config, &mut cache, &cli)
            .resolve(&state(
                &format!("n/{GRIP_B}"),
                "PIN for key 1122334455667788",
            ))
            .await;
        assert_eq!(found.as_deref(), Some("work"));
        assert_eq!(cli.lookups.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_hint_is_none() {
        let config = config();
        let mut cache = IdentityCache::default();
        let cli = RecordingCli::default();

        let found = IdentityResolver::new(&config, &mut cache, &cli)
            .resolve(&state(
                "n/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                "Please enter the PIN for key 0000000000000000",
            ))
            .await;
        assert_eq!(found, None);
        assert!(cache.is_empty());
    }
}
