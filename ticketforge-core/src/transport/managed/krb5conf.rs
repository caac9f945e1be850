//! Realm configuration (`krb5.conf`).
//!
//! Only the parts the client needs are kept: the default realm, the KDCs of
//! each realm and the host to realm mapping. Unknown sections and relations
//! are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default KDC port.
pub const KDC_PORT: u16 = 88;

const DEFAULT_PATH: &str = "/etc/krb5.conf";

/// Error type for realm configuration loading.
#[derive(Debug, Error)]
pub enum Krb5ConfError {
    #[error("cannot read realm configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("realm configuration line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// One `[realms]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmConfig {
    pub kdcs: Vec<String>,
}

/// Parsed `krb5.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Krb5Config {
    pub default_realm: Option<String>,
    pub realms: HashMap<String, RealmConfig>,
    /// `(domain, realm)` in file order. A leading `.` matches subdomains.
    pub domain_realm: Vec<(String, String)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    LibDefaults,
    Realms,
    DomainRealm,
    Other,
}

impl Krb5Config {
    pub fn load(path: &Path) -> Result<Self, Krb5ConfError> {
        let text = std::fs::read_to_string(path).map_err(|source| Krb5ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Krb5ConfError> {
        let mut config = Self::default();
        let mut section = Section::Other;
        // Realm currently open in [realms] and the brace depth inside it.
        let mut realm: Option<String> = None;
        let mut depth = 0usize;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if depth == 0 && line.starts_with('[') {
                let name = line
                    .strip_prefix('[')
                    .and_then(|l| l.split_once(']'))
                    .map(|(name, _)| name.trim())
                    .ok_or_else(|| Krb5ConfError::Syntax {
                        line: line_no,
                        message: "unterminated section header".to_string(),
                    })?;
                section = match name {
                    "libdefaults" => Section::LibDefaults,
                    "realms" => Section::Realms,
                    "domain_realm" => Section::DomainRealm,
                    _ => Section::Other,
                };
                continue;
            }

            if line == "}" || line.starts_with('}') {
                if depth == 0 {
                    return Err(Krb5ConfError::Syntax {
                        line: line_no,
                        message: "unexpected '}'".to_string(),
                    });
                }
                depth -= 1;
                if depth == 0 {
                    realm = None;
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Krb5ConfError::Syntax {
                    line: line_no,
                    message: format!("expected 'name = value', got '{}'", line),
                });
            };
            let key = key.trim();
            let value = value.trim();

            if value == "{" {
                if depth == 0 && section == Section::Realms {
                    realm = Some(key.to_string());
                    config.realms.entry(key.to_string()).or_default();
                }
                depth += 1;
                continue;
            }

            match section {
                Section::LibDefaults if depth == 0 && key == "default_realm" => {
                    config.default_realm = Some(value.to_string());
                }
                Section::Realms if depth == 1 && key == "kdc" => {
                    if let Some(name) = &realm {
                        config
                            .realms
                            .entry(name.clone())
                            .or_default()
                            .kdcs
                            .push(value.to_string());
                    }
                }
                Section::DomainRealm if depth == 0 => {
                    config
                        .domain_realm
                        .push((key.to_ascii_lowercase(), value.to_string()));
                }
                _ => {}
            }
        }

        if depth != 0 {
            return Err(Krb5ConfError::Syntax {
                line: text.lines().count(),
                message: "unterminated '{' block".to_string(),
            });
        }

        Ok(config)
    }

    /// KDC endpoints for `realm` as `(host, port)`, in configured order.
    pub fn kdcs(&self, realm: &str) -> Vec<(String, u16)> {
        self.realms
            .get(realm)
            .map(|r| r.kdcs.iter().filter_map(|k| parse_kdc(k)).collect())
            .unwrap_or_default()
    }

    /// The realm `[domain_realm]` assigns to `host`.
    ///
    /// An exact entry wins over a `.domain` entry; among `.domain` entries the
    /// longest matching suffix wins.
    pub fn realm_for_host(&self, host: &str) -> Option<&str> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some((_, realm)) = self.domain_realm.iter().find(|(d, _)| *d == host) {
            return Some(realm);
        }

        self.domain_realm
            .iter()
            .filter(|(d, _)| d.starts_with('.') && host.ends_with(d.as_str()))
            .max_by_key(|(d, _)| d.len())
            .map(|(_, realm)| realm.as_str())
    }
}

/// `KRB5_CONFIG` if set, otherwise `/etc/krb5.conf`; an explicit override wins.
///
/// `KRB5_CONFIG` may list several files separated by `:`; the first is used.
pub fn resolve_path(override_path: Option<&Path>, env_value: Option<&str>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    env_value
        .and_then(|v| v.split(':').map(str::trim).find(|p| !p.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PATH))
}

fn parse_kdc(entry: &str) -> Option<(String, u16)> {
    let entry = entry
        .strip_prefix("tcp/")
        .or_else(|| entry.strip_prefix("udp/"))
        .unwrap_or(entry);

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => KDC_PORT,
        };
        return Some((host.to_string(), port));
    }

    match entry.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None if !entry.is_empty() => Some((entry.to_string(), KDC_PORT)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Sample configuration
[libdefaults]
    default_realm = EXAMPLE.COM
    dns_lookup_kdc = false

[realms]
    EXAMPLE.COM = {
        kdc = kdc1.example.com
        kdc = kdc2.example.com:750
        admin_server = kdc1.example.com
        v4_name_convert = {
            host = {
                rcmd = host
            }
        }
    }
    CORP.EXAMPLE.COM = {
        kdc = [2001:db8::1]:88
        kdc = tcp/dc01.corp.example.com
    }

[domain_realm]
    .example.com = EXAMPLE.COM
    example.com = EXAMPLE.COM
    .corp.example.com = CORP.EXAMPLE.COM
"#;

    #[test]
    fn test_parse_sample() {
        let config = Krb5Config::parse(SAMPLE).unwrap();
        assert_eq!(config.default_realm.as_deref(), Some("EXAMPLE.COM"));
        assert_eq!(
            config.kdcs("EXAMPLE.COM"),
            vec![
                ("kdc1.example.com".to_string(), 88),
                ("kdc2.example.com".to_string(), 750)
            ]
        );
        assert_eq!(
            config.kdcs("CORP.EXAMPLE.COM"),
            vec![
                ("2001:db8::1".to_string(), 88),
                ("dc01.corp.example.com".to_string(), 88)
            ]
        );
        assert!(config.kdcs("NOWHERE").is_empty());
    }

    #[test]
    fn test_domain_realm_mapping() {
        let config = Krb5Config::parse(SAMPLE).unwrap();
        assert_eq!(config.realm_for_host("example.com"), Some("EXAMPLE.COM"));
        assert_eq!(config.realm_for_host("svc.example.com"), Some("EXAMPLE.COM"));
        assert_eq!(
            config.realm_for_host("web.corp.example.com"),
            Some("CORP.EXAMPLE.COM")
        );
        assert_eq!(config.realm_for_host("SVC.Example.COM."), Some("EXAMPLE.COM"));
        assert_eq!(config.realm_for_host("other.org"), None);
    }

    #[test]
    fn test_unbalanced_braces_rejected() {
        let err = Krb5Config::parse("[realms]\nA = {\n kdc = x\n").unwrap_err();
        assert!(matches!(err, Krb5ConfError::Syntax { .. }));

        let err = Krb5Config::parse("[realms]\n}\n").unwrap_err();
        assert!(matches!(err, Krb5ConfError::Syntax { line: 2, .. }));
    }

    #[test]
    fn test_garbage_line_rejected() {
        let err = Krb5Config::parse("[libdefaults]\nthis is not a relation\n").unwrap_err();
        assert!(matches!(err, Krb5ConfError::Syntax { line: 2, .. }));
    }

    #[test]
    fn test_resolve_path() {
        let explicit = PathBuf::from("/custom/krb5.conf");
        assert_eq!(resolve_path(Some(&explicit), Some("/env/krb5.conf")), explicit);
        assert_eq!(
            resolve_path(None, Some("/env/a.conf:/env/b.conf")),
            PathBuf::from("/env/a.conf")
        );
        assert_eq!(resolve_path(None, None), PathBuf::from("/etc/krb5.conf"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krb5.conf");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Krb5Config::load(&path).unwrap();
        assert_eq!(config.realms.len(), 2);

        let missing = Krb5Config::load(&dir.path().join("absent.conf")).unwrap_err();
        assert!(matches!(missing, Krb5ConfError::Io { .. }));
    }
}
