//! Node configuration, loaded via `clap::Parser` with `env` fallbacks, the
//! same shape as `freeq-bots::Args`. Mirrors `esence/config.py`.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "esence-node", about = "A personal peer-to-peer agent node")]
pub struct Config {
    /// Language-model provider: "anthropic", "null", or "auto".
    #[arg(long, env = "ESENCE_PROVIDER", default_value = "auto")]
    pub provider: String,

    #[arg(long, env = "ANTHROPIC_API_KEY", default_value = "")]
    pub anthropic_api_key: String,

    /// Model name passed to the selected provider.
    #[arg(long, env = "ESENCE_MODEL", default_value = "claude-sonnet-4-5")]
    pub model: String,

    #[arg(long, env = "ESENCE_NODE_NAME", default_value = "node0")]
    pub node_name: String,

    #[arg(long, env = "ESENCE_DOMAIN", default_value = "localhost")]
    pub domain: String,

    #[arg(long, env = "ESENCE_DONATION_PCT", default_value_t = 10)]
    pub donation_pct: u8,

    #[arg(long, env = "ESENCE_PORT", default_value_t = 7777)]
    pub port: u16,

    /// DID of a peer to bootstrap trust with on startup.
    #[arg(long, env = "ESENCE_BOOTSTRAP_PEER", default_value = "")]
    pub bootstrap_peer: String,

    /// Externally reachable base URL, if already known (skips tunnel discovery).
    #[arg(long, env = "ESENCE_PUBLIC_URL", default_value = "")]
    pub public_url: String,

    /// Accept unsigned/unverifiable inbound messages. Development only.
    #[arg(long, env = "ESENCE_DEV_SKIP_SIG", default_value_t = false)]
    pub dev_skip_sig: bool,

    #[arg(long, env = "ESENCE_STORE_DIR", default_value = "./esence-store")]
    pub store_dir: String,
}

impl Config {
    /// The host:port (or bare host) peers should resolve this node at.
    pub fn effective_did_domain(&self) -> String {
        if !self.public_url.is_empty() {
            return host_from_url(&self.public_url);
        }
        if self.domain.starts_with("localhost") || self.domain.starts_with("127.") {
            return format!("{}%3A{}", self.domain, self.port);
        }
        self.domain.clone()
    }

    pub fn effective_domain(&self) -> String {
        if !self.public_url.is_empty() {
            return host_from_url(&self.public_url);
        }
        self.domain.clone()
    }

    pub fn did(&self) -> String {
        format!("did:wba:{}:{}", self.effective_did_domain(), self.node_name)
    }

    /// URL peers should GET to fetch this node's identity document.
    pub fn did_document_url(&self) -> String {
        if !self.public_url.is_empty() {
            return format!("{}/.well-known/did.json", self.public_url.trim_end_matches('/'));
        }
        if self.domain.starts_with("localhost") || self.domain.starts_with("127.") {
            format!("http://{}:{}/.well-known/did.json", self.domain, self.port)
        } else {
            format!("https://{}/.well-known/did.json", self.domain)
        }
    }

    /// Human-readable configuration problems. Never aborts on its own —
    /// the caller decides whether to proceed.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.node_name.is_empty() || self.node_name == "yourname" {
            problems.push("node_name is unset or still the placeholder value".to_string());
        }
        match self.provider.as_str() {
            "anthropic" | "auto" if self.anthropic_api_key.is_empty() => {
                problems.push("provider requires ANTHROPIC_API_KEY".to_string());
            }
            _ => {}
        }
        problems
    }
}

fn host_from_url(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            provider: "anthropic".into(),
            anthropic_api_key: "key".into(),
            model: "claude-sonnet-4-5".into(),
            node_name: "node0".into(),
            domain: "localhost".into(),
            donation_pct: 10,
            port: 7777,
            bootstrap_peer: "".into(),
            public_url: "".into(),
            dev_skip_sig: false,
            store_dir: "./esence-store".into(),
        }
    }

    #[test]
    fn loopback_domain_embeds_percent_encoded_port() {
        let config = base_config();
        assert_eq!(config.effective_did_domain(), "localhost%3A7777");
        assert_eq!(config.did(), "did:wba:localhost%3A7777:node0");
    }

    #[test]
    fn public_url_overrides_domain() {
        let mut config = base_config();
        config.public_url = "https://node0.ngrok.io".into();
        assert_eq!(config.effective_did_domain(), "node0.ngrok.io");
        assert_eq!(config.did(), "did:wba:node0.ngrok.io:node0");
    }

    #[test]
    fn remote_domain_has_no_port_suffix() {
        let mut config = base_config();
        config.domain = "example.com".into();
        assert_eq!(config.effective_did_domain(), "example.com");
    }

    #[test]
    fn validate_flags_placeholder_name_and_missing_key() {
        let mut config = base_config();
        config.node_name = "yourname".into();
        config.anthropic_api_key = "".into();
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
    }
}
