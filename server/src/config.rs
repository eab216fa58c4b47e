//! Server configuration from command line and process environment.

use clap::Parser;

// Command line arguments; every option can also come from the environment.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to listen on
    #[clap(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Comma-separated allowed origin patterns (exact or "*." wildcard)
    #[clap(long, env = "ALLOWED_ORIGINS", default_value = "")]
    pub allowed_origins: String,

    /// Postgres connection string for the durable store
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Store service key; also the HS256 fallback for token verification
    #[clap(long, env = "SERVICE_KEY")]
    pub service_key: Option<String>,

    /// Public endpoint URL advertised in session rows
    #[clap(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Region tag attached to session logging
    #[clap(long, env = "REGION", default_value = "local")]
    pub region: String,

    /// Accept unsigned display-name tokens (development deployments only)
    #[clap(long, env = "DISPLAY_NAME_AUTH")]
    pub display_name_auth: bool,
}

/// One entry of the origin allowlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPattern {
    /// Matches the whole origin string or its host exactly.
    Exact(String),
    /// `*.example.com`: matches any host ending with the stored suffix.
    Subdomain(String),
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub allowed_origins: Vec<OriginPattern>,
    pub database_url: Option<String>,
    pub service_key: Option<String>,
    pub public_url: String,
    pub region: String,
    pub display_name_auth: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let bind_addr = format!("{}:{}", args.host, args.port);
        let public_url = args
            .public_url
            .unwrap_or_else(|| format!("ws://{}:{}", args.host, args.port));
        Self {
            bind_addr,
            allowed_origins: parse_origin_patterns(&args.allowed_origins),
            database_url: args.database_url,
            service_key: args.service_key,
            public_url,
            region: args.region,
            display_name_auth: args.display_name_auth,
        }
    }

    /// Checks a connection's Origin header against the allowlist.
    ///
    /// Connections without an Origin header (non-browser clients) pass, and
    /// localhost origins are always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let origin = match origin {
            Some(origin) => origin,
            None => return true,
        };
        let host = origin_host(origin);
        if matches!(host, "localhost" | "127.0.0.1" | "[::1]") {
            return true;
        }
        self.allowed_origins.iter().any(|pattern| match pattern {
            OriginPattern::Exact(exact) => exact == origin || exact == host,
            OriginPattern::Subdomain(suffix) => host.ends_with(suffix.as_str()),
        })
    }
}

fn parse_origin_patterns(raw: &str) -> Vec<OriginPattern> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if let Some(suffix) = entry.strip_prefix("*.") {
                OriginPattern::Subdomain(format!(".{suffix}"))
            } else {
                OriginPattern::Exact(entry.to_string())
            }
        })
        .collect()
}

/// Extracts the host portion of an origin string.
fn origin_host(origin: &str) -> &str {
    let rest = origin.split("://").nth(1).unwrap_or(origin);
    let rest = rest.split('/').next().unwrap_or(rest);
    // Bracketed IPv6 hosts keep their brackets; only a trailing port is cut.
    if rest.starts_with('[') {
        match rest.rfind(']') {
            Some(end) => &rest[..=end],
            None => rest,
        }
    } else {
        rest.split(':').next().unwrap_or(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(origins: &str) -> Config {
        Config {
            bind_addr: "0.0.0.0:8080".to_string(),
            allowed_origins: parse_origin_patterns(origins),
            database_url: None,
            service_key: None,
            public_url: "ws://localhost:8080".to_string(),
            region: "local".to_string(),
            display_name_auth: false,
        }
    }

    #[test]
    fn test_missing_origin_is_allowed() {
        assert!(config_with("https://play.example.com").origin_allowed(None));
    }

    #[test]
    fn test_localhost_always_allowed() {
        let config = config_with("https://play.example.com");
        assert!(config.origin_allowed(Some("http://localhost:5173")));
        assert!(config.origin_allowed(Some("http://127.0.0.1:3000")));
    }

    #[test]
    fn test_exact_origin_match() {
        let config = config_with("https://play.example.com");
        assert!(config.origin_allowed(Some("https://play.example.com")));
        assert!(!config.origin_allowed(Some("https://evil.example.org")));
    }

    #[test]
    fn test_wildcard_subdomain_match() {
        let config = config_with("*.example.com");
        assert!(config.origin_allowed(Some("https://play.example.com")));
        assert!(config.origin_allowed(Some("https://eu.play.example.com:444")));
        assert!(!config.origin_allowed(Some("https://example.org")));
        // The bare apex is not a subdomain.
        assert!(!config.origin_allowed(Some("https://example.com")));
    }

    #[test]
    fn test_pattern_list_parsing() {
        let patterns = parse_origin_patterns(" https://a.example , *.b.example ,, ");
        assert_eq!(
            patterns,
            vec![
                OriginPattern::Exact("https://a.example".to_string()),
                OriginPattern::Subdomain(".b.example".to_string()),
            ]
        );
    }

    #[test]
    fn test_origin_host_extraction() {
        assert_eq!(origin_host("https://play.example.com:8443"), "play.example.com");
        assert_eq!(origin_host("http://localhost"), "localhost");
        assert_eq!(origin_host("https://[::1]:9000"), "[::1]");
    }
}
