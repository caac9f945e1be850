//! MIT file credential cache reader.
//!
//! The file is decoded by `kerberos_ccache`, which reads format version 4
//! (`0x0504`), the format every current MIT and Heimdal release writes.
//! Configuration entries stored by MIT tooling (server realm `X-CACHECONF:`)
//! are skipped while loading.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::SecretBytes;

const CONF_REALM: &str = "X-CACHECONF:";

const VERSION_4: u16 = 0x0504;

/// Error type for credential cache loading.
#[derive(Debug, Error)]
pub enum CcacheError {
    /// The cache file could not be read.
    #[error("cannot read credential cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A cache type other than `FILE:` was named.
    #[error("unsupported credential cache type: {kind}")]
    UnsupportedType { kind: String },

    /// The file is not a version 4 cache.
    #[error("unsupported credential cache version: {version:#06x}")]
    UnsupportedVersion { version: u16 },

    /// The file could not be decoded.
    #[error("malformed credential cache: {message}")]
    Malformed { message: String },

    /// A principal name is not valid UTF-8.
    #[error("invalid principal encoding in credential cache")]
    InvalidEncoding,
}

/// A Kerberos principal name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub name_type: i32,
    pub realm: String,
    pub components: Vec<String>,
}

impl Principal {
    pub fn new(name_type: i32, realm: impl Into<String>, components: Vec<String>) -> Self {
        Self {
            name_type,
            realm: realm.into(),
            components,
        }
    }

    /// `krbtgt/REALM@REALM`
    pub fn tgt(realm: &str) -> Self {
        Self::new(
            super::messages::NT_SRV_INST,
            realm,
            vec!["krbtgt".to_string(), realm.to_string()],
        )
    }

    /// `component/.../component` without the realm.
    pub fn name(&self) -> String {
        self.components.join("/")
    }

    /// Whether this names a ticket-granting service for `realm`.
    pub fn is_tgt_for(&self, realm: &str) -> bool {
        self.realm == realm
            && self.components.len() == 2
            && self.components[0] == "krbtgt"
            && self.components[1] == realm
    }

    /// Name match ignoring name type, the way the library compares principals.
    pub fn same_name(&self, other: &Principal) -> bool {
        self.realm == other.realm && self.components == other.components
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name(), self.realm)
    }
}

/// A session key with its encryption type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub enctype: i32,
    pub value: SecretBytes,
}

/// One cached ticket.
#[derive(Debug, Clone)]
pub struct Credential {
    pub client: Principal,
    pub server: Principal,
    pub key: SessionKey,
    pub auth_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub renew_till: DateTime<Utc>,
    pub is_skey: bool,
    pub flags: u32,
    /// The DER encoded `Ticket`, opaque to the client.
    pub ticket: Bytes,
}

impl Credential {
    /// Whether the ticket can be used at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.end_time > now
    }
}

/// A loaded credential cache.
#[derive(Debug, Clone)]
pub struct CCache {
    pub version: u16,
    pub default_principal: Principal,
    pub credentials: Vec<Credential>,
}

impl CCache {
    /// Read and parse the cache at `path`.
    pub fn load(path: &Path) -> Result<Self, CcacheError> {
        let data = std::fs::read(path).map_err(|source| CcacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(Bytes::from(data))
    }

    /// Parse a cache image.
    pub fn parse(data: Bytes) -> Result<Self, CcacheError> {
        let version = match data.get(..2) {
            Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
            _ => {
                return Err(CcacheError::Malformed {
                    message: "missing file format version".to_string(),
                });
            }
        };
        if version != VERSION_4 {
            return Err(CcacheError::UnsupportedVersion { version });
        }

        let (rest, raw) = kerberos_ccache::CCache::parse(&data).map_err(|e| CcacheError::Malformed {
            message: format!("{:?}", e),
        })?;
        if !rest.is_empty() {
            return Err(CcacheError::Malformed {
                message: format!("{} undecoded bytes after the last credential", rest.len()),
            });
        }

        let default_principal = principal(&raw.primary_principal)?;
        let mut credentials = Vec::with_capacity(raw.credentials.len());
        for cred in &raw.credentials {
            let cred = credential(cred)?;
            if cred.server.realm == CONF_REALM {
                continue;
            }
            credentials.push(cred);
        }

        Ok(Self {
            version,
            default_principal,
            credentials,
        })
    }

    /// The newest valid TGT for `realm` issued to the default principal.
    pub fn find_tgt(&self, realm: &str, now: DateTime<Utc>) -> Option<&Credential> {
        self.credentials
            .iter()
            .filter(|c| c.server.is_tgt_for(realm))
            .filter(|c| c.client.same_name(&self.default_principal))
            .filter(|c| c.is_valid_at(now))
            .max_by_key(|c| c.end_time)
    }

    /// A still-valid cached ticket for `server`, if the cache holds one.
    pub fn find_service(&self, server: &Principal, now: DateTime<Utc>) -> Option<&Credential> {
        self.credentials
            .iter()
            .filter(|c| c.server.same_name(server))
            .filter(|c| c.client.same_name(&self.default_principal))
            .filter(|c| c.is_valid_at(now))
            .max_by_key(|c| c.end_time)
    }
}

/// Resolve the cache file from an override, `KRB5CCNAME`, or the per-user default.
///
/// `FILE:` prefixes are stripped. Other cache types are rejected.
pub fn resolve_path(
    override_path: Option<&Path>,
    env_value: Option<&str>,
) -> Result<PathBuf, CcacheError> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }
    match env_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => parse_cache_name(value),
        None => Ok(default_path()),
    }
}

fn parse_cache_name(value: &str) -> Result<PathBuf, CcacheError> {
    if let Some(path) = value.strip_prefix("FILE:") {
        return Ok(PathBuf::from(path));
    }
    // A bare path may itself contain a colon only after a type prefix.
    match value.split_once(':') {
        Some((kind, _)) if !kind.contains('/') => Err(CcacheError::UnsupportedType {
            kind: kind.to_string(),
        }),
        _ => Ok(PathBuf::from(value)),
    }
}

/// `/tmp/krb5cc_<uid>`
pub fn default_path() -> PathBuf {
    PathBuf::from(format!("/tmp/krb5cc_{}", current_uid()))
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

fn text(data: &[u8]) -> Result<String, CcacheError> {
    String::from_utf8(data.to_vec()).map_err(|_| CcacheError::InvalidEncoding)
}

fn time(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
}

fn principal(raw: &kerberos_ccache::Principal) -> Result<Principal, CcacheError> {
    Ok(Principal {
        name_type: raw.name_type as i32,
        realm: text(&raw.realm.data)?,
        components: raw
            .components
            .iter()
            .map(|c| text(&c.data))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

fn credential(raw: &kerberos_ccache::Credential) -> Result<Credential, CcacheError> {
    Ok(Credential {
        client: principal(&raw.client)?,
        server: principal(&raw.server)?,
        key: SessionKey {
            enctype: i32::from(raw.key.keytype),
            value: SecretBytes::new(raw.key.keyvalue.clone()),
        },
        auth_time: time(raw.time.authtime),
        start_time: time(raw.time.starttime),
        end_time: time(raw.time.endtime),
        renew_till: time(raw.time.renew_till),
        is_skey: raw.is_skey != 0,
        flags: raw.tktflags,
        ticket: Bytes::copy_from_slice(&raw.ticket.data),
    })
}


#[cfg(test)]
mod tests {
    use super::fixture::credential;
    use super::fixture::*;
    use super::*;
    use chrono::{Duration, TimeZone};

    fn user() -> Principal {
        Principal::new(1, "EXAMPLE.COM", vec!["alice".to_string()])
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn sample(version: u16) -> CCache {
        let conf = credential(
            &user(),
            Principal::new(0, CONF_REALM, vec!["krb5_ccache_conf_data".into(), "pa_type".into()]),
            &[],
            DateTime::from_timestamp(0, 0).unwrap(),
            b"2",
        );
        CCache {
            version,
            default_principal: user(),
            credentials: vec![
                conf,
                credential(&user(), Principal::tgt("EXAMPLE.COM"), &[7; 32], now() + Duration::hours(8), b"tgt"),
                credential(
                    &user(),
                    Principal::new(2, "EXAMPLE.COM", vec!["HTTP".into(), "svc.example.com".into()]),
                    &[9; 32],
                    now() - Duration::hours(1),
                    b"expired-service",
                ),
            ],
        }
    }

    #[test]
    fn test_parse_version_4() {
        let cache = CCache::parse(Bytes::from(encode(&sample(0x0504)))).unwrap();
        assert_eq!(cache.version, 0x0504);
        assert_eq!(cache.default_principal.to_string(), "alice@EXAMPLE.COM");
        // Configuration entry skipped.
        assert_eq!(cache.credentials.len(), 2);
        assert_eq!(cache.credentials[0].key.value.expose(), &[7; 32]);
        assert_eq!(&cache.credentials[0].ticket[..], b"tgt");
    }

    #[test]
    fn test_version_3_rejected() {
        let err = CCache::parse(Bytes::from(encode(&sample(0x0503)))).unwrap_err();
        assert!(matches!(err, CcacheError::UnsupportedVersion { version: 0x0503 }));
    }

    #[test]
    fn test_find_tgt_and_expired_service() {
        let cache = CCache::parse(Bytes::from(encode(&sample(0x0504)))).unwrap();
        assert!(cache.find_tgt("EXAMPLE.COM", now()).is_some());
        assert!(cache.find_tgt("OTHER.COM", now()).is_none());
        assert!(cache.find_tgt("EXAMPLE.COM", now() + Duration::hours(9)).is_none());

        let service = Principal::new(2, "EXAMPLE.COM", vec!["HTTP".into(), "svc.example.com".into()]);
        assert!(cache.find_service(&service, now()).is_none());
        assert!(cache.find_service(&service, now() - Duration::hours(2)).is_some());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let err = CCache::parse(Bytes::from_static(&[0x05, 0x02, 0, 0])).unwrap_err();
        assert!(matches!(err, CcacheError::UnsupportedVersion { version: 0x0502 }));
    }

    #[test]
    fn test_truncated_cache() {
        let mut image = encode(&sample(0x0504));
        image.truncate(image.len() - 3);
        let err = CCache::parse(Bytes::from(image)).unwrap_err();
        assert!(matches!(err, CcacheError::Malformed { .. }));
    }

    #[test]
    fn test_empty_file_is_malformed() {
        let err = CCache::parse(Bytes::new()).unwrap_err();
        assert!(matches!(err, CcacheError::Malformed { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CCache::load(&dir.path().join("krb5cc_missing")).unwrap_err();
        assert!(matches!(err, CcacheError::Io { .. }));
    }

    #[test]
    fn test_resolve_path_priority() {
        let explicit = PathBuf::from("/override/cc");
        assert_eq!(
            resolve_path(Some(&explicit), Some("FILE:/env/cc")).unwrap(),
            explicit
        );
        assert_eq!(
            resolve_path(None, Some("FILE:/env/cc")).unwrap(),
            PathBuf::from("/env/cc")
        );
        assert_eq!(
            resolve_path(None, Some("/plain/path")).unwrap(),
            PathBuf::from("/plain/path")
        );
        assert_eq!(resolve_path(None, None).unwrap(), default_path());
        assert_eq!(resolve_path(None, Some("  ")).unwrap(), default_path());
    }

    #[test]
    fn test_resolve_rejects_other_cache_types() {
        for name in ["KEYRING:persistent:1000", "KCM:1000", "DIR:/run/user/1000/krb5cc", "MEMORY:x"] {
            let err = resolve_path(None, Some(name)).unwrap_err();
            assert!(matches!(err, CcacheError::UnsupportedType { .. }), "{name}");
        }
    }

    #[test]
    fn test_default_path_shape() {
        let path = default_path();
        assert!(path.to_string_lossy().starts_with("/tmp/krb5cc_"));
    }
}
