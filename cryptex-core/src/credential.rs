//! Credential model and content hashing.
//!
//! A credential's `id` is its only identity across devices. Everything else is
//! content, summarized by [`Credential::content_hash`] for equality checks.

use crate::totp::{self, ParsedTotpUri, TotpAlgorithm};
use crate::{CryptexError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

/// Hex SHA-256 digest of a credential's content fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// TOTP provisioning parameters attached to a credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totp {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub issuer: String,
    pub secret: String,
    pub period: u32,
    pub digits: u8,
    #[serde(default)]
    pub algorithm: TotpAlgorithm,
}

impl Totp {
    /// Defaults: 30 second period, 6 digits, SHA1.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            label: String::new(),
            issuer: String::new(),
            secret: secret.into(),
            period: 30,
            digits: 6,
            algorithm: TotpAlgorithm::Sha1,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(parse_otpauth(totp::parse_otpauth_uri(uri)?))
    }

    pub fn validate(&self) -> Result<()> {
        totp::validate_parameters(self.digits, self.period)?;
        totp::normalize_secret(&self.secret)?;
        Ok(())
    }
}

fn parse_otpauth(parsed: ParsedTotpUri) -> Totp {
    Totp {
        label: parsed.account_name.unwrap_or_default(),
        issuer: parsed.issuer.unwrap_or_default(),
        secret: parsed.secret_base32,
        period: parsed.period,
        digits: parsed.digits,
        algorithm: parsed.algorithm,
    }
}

impl fmt::Debug for Totp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Totp")
            .field("label", &self.label)
            .field("issuer", &self.issuer)
            .field("secret", &"<redacted>")
            .field("period", &self.period)
            .field("digits", &self.digits)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Drop for Totp {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// A stored secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub totp: Option<Totp>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub notes: String,
    pub date_created: DateTime<Utc>,
    #[serde(default)]
    pub date_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_password_changed: Option<DateTime<Utc>>,
}

impl Credential {
    /// Create a credential with a freshly generated id.
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            username: username.into(),
            password: password.into(),
            totp: None,
            tags: BTreeSet::new(),
            url: String::new(),
            notes: String::new(),
            date_created: Utc::now(),
            date_modified: None,
            date_password_changed: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_totp(mut self, totp: Totp) -> Self {
        self.totp = Some(totp);
        self
    }

    /// Replace the password and stamp both modification dates.
    pub fn set_password(&mut self, password: impl Into<String>) {
        let now = Utc::now();
        self.password.zeroize();
        self.password = password.into();
        self.date_password_changed = Some(now);
        self.date_modified = Some(now);
    }

    pub fn touch(&mut self) {
        self.date_modified = Some(Utc::now());
    }

    /// Deterministic digest over every content field.
    ///
    /// Tags are hashed in sorted order, TOTP secrets in their normalized
    /// base32 form and timestamps as millisecond integers. The id is not part
    /// of the hash.
    pub fn content_hash(&self) -> ContentHash {
        let canonical = CanonicalCredential {
            name: &self.name,
            username: &self.username,
            password: &self.password,
            totp: self.totp.as_ref().map(CanonicalTotp::from),
            tags: self.tags.iter().map(|t| t.as_str()).collect(),
            url: &self.url,
            notes: &self.notes,
            date_created: self.date_created.timestamp_millis(),
            date_modified: self.date_modified.map(|d| d.timestamp_millis()),
            date_password_changed: self.date_password_changed.map(|d| d.timestamp_millis()),
        };

        // Serializing borrowed strings, integers and vectors cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        ContentHash(hex::encode(digest))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("totp", &self.totp)
            .field("tags", &self.tags)
            .field("url", &self.url)
            .field("date_created", &self.date_created)
            .field("date_modified", &self.date_modified)
            .finish()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.password.zeroize();
        self.notes.zeroize();
        self.username.zeroize();
    }
}

#[derive(Serialize)]
struct CanonicalCredential<'a> {
    name: &'a str,
    username: &'a str,
    password: &'a str,
    totp: Option<CanonicalTotp<'a>>,
    tags: Vec<&'a str>,
    url: &'a str,
    notes: &'a str,
    date_created: i64,
    date_modified: Option<i64>,
    date_password_changed: Option<i64>,
}

#[derive(Serialize)]
struct CanonicalTotp<'a> {
    label: &'a str,
    issuer: &'a str,
    secret: String,
    period: u32,
    digits: u8,
    algorithm: TotpAlgorithm,
}

impl<'a> From<&'a Totp> for CanonicalTotp<'a> {
    fn from(totp: &'a Totp) -> Self {
        Self {
            label: totp.label.trim(),
            issuer: totp.issuer.trim(),
            secret: totp
                .secret
                .trim()
                .replace([' ', '-'], "")
                .to_ascii_uppercase(),
            period: totp.period,
            digits: totp.digits,
            algorithm: totp.algorithm,
        }
    }
}

/// A live one-time code and the seconds until it rotates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpCode {
    pub code: String,
    pub time_remaining: u32,
}

/// Compute the current TOTP code for a credential. Pure in `now`.
pub fn calculate_totp(credential: &Credential, now: DateTime<Utc>) -> Result<TotpCode> {
    let config = credential.totp.as_ref().ok_or_else(|| {
        CryptexError::InvalidInput(format!("Credential '{}' has no TOTP", credential.name))
    })?;

    let timestamp = now.timestamp();
    let code = totp::generate_totp_code(
        &config.secret,
        config.algorithm,
        config.digits,
        config.period,
        timestamp,
    )?;

    Ok(TotpCode {
        code,
        time_remaining: totp::seconds_remaining(config.period, timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Credential {
        let mut c = Credential::new("GitHub", "alice", "hunter2")
            .with_url("https://github.com")
            .with_tags(["work", "dev", "code"]);
        c.date_created = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        c
    }

    #[test]
    fn hash_is_stable() {
        let c = sample();
        assert_eq!(c.content_hash(), c.content_hash());
        assert_eq!(c.content_hash().as_str().len(), 64);
    }

    #[test]
    fn hash_ignores_tag_insertion_order() {
        let a = sample();
        let b = sample().with_tags(["code", "work", "dev"]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn hash_excludes_id() {
        let a = sample();
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn hash_covers_content_fields() {
        let a = sample();

        let mut b = a.clone();
        b.password = "hunter3".to_string();
        assert_ne!(a.content_hash(), b.content_hash());

        let c = a.clone().with_notes("recovery codes in the safe");
        assert_ne!(a.content_hash(), c.content_hash());

        let mut d = a.clone();
        d.touch();
        assert_ne!(a.content_hash(), d.content_hash());
    }

    #[test]
    fn hash_normalizes_totp_secret() {
        let a = sample().with_totp(Totp::new("JBSW Y3DP EHPK 3PXP"));
        let b = sample().with_totp(Totp::new("jbswy3dpehpk3pxp"));
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn hash_survives_json_roundtrip() {
        let a = sample().with_totp(Totp::new("JBSWY3DPEHPK3PXP"));
        let json = serde_json::to_string(&a).unwrap();
        let b: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn set_password_stamps_dates() {
        let mut c = sample();
        c.set_password("new");
        assert_eq!(c.password, "new");
        assert!(c.date_password_changed.is_some());
        assert_eq!(c.date_modified, c.date_password_changed);
    }

    #[test]
    fn debug_redacts_secrets() {
        let c = sample().with_totp(Totp::new("JBSWY3DPEHPK3PXP"));
        let rendered = format!("{:?}", c);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn calculate_totp_matches_rfc_vector() {
        let mut totp = Totp::new("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ");
        totp.digits = 8;
        let c = sample().with_totp(totp);

        let now = Utc.timestamp_opt(59, 0).unwrap();
        let code = calculate_totp(&c, now).unwrap();
        assert_eq!(code.code, "94287082");
        assert_eq!(code.time_remaining, 1);
    }

    #[test]
    fn calculate_totp_without_config_fails() {
        let err = calculate_totp(&sample(), Utc::now()).unwrap_err();
        assert!(matches!(err, CryptexError::InvalidInput(_)));
    }

    #[test]
    fn totp_from_uri() {
        let totp = Totp::from_uri(
            "otpauth://totp/Acme:alice@example.com?secret=JBSWY3DPEHPK3PXP&issuer=Acme",
        )
        .unwrap();
        assert_eq!(totp.issuer, "Acme");
        assert_eq!(totp.label, "alice@example.com");
        assert!(totp.validate().is_ok());
    }
}
