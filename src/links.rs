use crate::config::Config;

#[derive(Debug, Clone)]
pub struct LinkNormalizer {
    scheme_prefix: String,
    gateway: String,
}

impl LinkNormalizer {
    pub fn new(scheme_prefix: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            scheme_prefix: scheme_prefix.into(),
            gateway: gateway.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ipfs_scheme_prefix.clone(),
            config.ipfs_gateway.clone(),
        )
    }

    pub fn is_content_addressed(&self, uri: &str) -> bool {
        !self.scheme_prefix.is_empty() && uri.starts_with(self.scheme_prefix.as_str())
    }

    pub fn normalize(&self, uri: &str) -> String {
        if !self.is_content_addressed(uri) {
            return uri.to_string();
        }
        let rest = &uri[self.scheme_prefix.len()..];
        // ipfs://ipfs/<cid> shows up in the wild; the gateway already carries the namespace
        let namespace = format!("{}/", self.scheme_prefix.trim_end_matches("://"));
        let rest = rest.strip_prefix(namespace.as_str()).unwrap_or(rest);
        format!("{}{}", self.gateway, rest)
    }
}
