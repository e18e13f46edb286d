//! TOTP (RFC 6238) support for one-time codes.

use crate::{CryptexError, Result};
use data_encoding::{BASE32, BASE32_NOPAD};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::str::FromStr;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Supported TOTP HMAC algorithms.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TotpAlgorithm {
    #[default]
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA512")]
    Sha512,
}

impl std::fmt::Display for TotpAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TotpAlgorithm::Sha1 => write!(f, "SHA1"),
            TotpAlgorithm::Sha256 => write!(f, "SHA256"),
            TotpAlgorithm::Sha512 => write!(f, "SHA512"),
        }
    }
}

impl FromStr for TotpAlgorithm {
    type Err = CryptexError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(TotpAlgorithm::Sha1),
            "sha256" => Ok(TotpAlgorithm::Sha256),
            "sha512" => Ok(TotpAlgorithm::Sha512),
            other => Err(CryptexError::InvalidInput(format!(
                "Unsupported TOTP algorithm '{}'. Use 'sha1', 'sha256' or 'sha512'.",
                other
            ))),
        }
    }
}

/// Parsed provisioning data from an `otpauth://totp/...` URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTotpUri {
    pub secret_base32: String,
    pub algorithm: TotpAlgorithm,
    pub digits: u8,
    pub period: u32,
    pub issuer: Option<String>,
    pub account_name: Option<String>,
}

/// Parse an `otpauth://totp/...` URI (commonly embedded in QR codes).
pub fn parse_otpauth_uri(uri: &str) -> Result<ParsedTotpUri> {
    let trimmed = uri.trim();
    let (scheme, rest) = trimmed.split_once("://").ok_or_else(|| {
        CryptexError::InvalidInput("TOTP URI must start with otpauth://".to_string())
    })?;
    if !scheme.eq_ignore_ascii_case("otpauth") {
        return Err(CryptexError::InvalidInput(
            "TOTP URI must start with otpauth://".to_string(),
        ));
    }

    let (kind, remainder) = rest
        .split_once('/')
        .ok_or_else(|| CryptexError::InvalidInput("Invalid otpauth URI format".to_string()))?;
    if !kind.eq_ignore_ascii_case("totp") {
        return Err(CryptexError::InvalidInput(
            "Only otpauth://totp URIs are supported".to_string(),
        ));
    }

    let (label_raw, query_raw) = remainder.split_once('?').unwrap_or((remainder, ""));

    let label = percent_decode(label_raw)?;
    let (issuer_from_label, account_name) = match label.split_once(':') {
        Some((issuer, account)) => (non_empty(issuer), non_empty(account)),
        None => (None, non_empty(&label)),
    };

    let mut secret_base32 = None;
    let mut issuer_from_query = None;
    let mut algorithm = TotpAlgorithm::Sha1;
    let mut digits: u8 = 6;
    let mut period: u32 = 30;

    for pair in query_raw.split('&').filter(|part| !part.is_empty()) {
        let (key_raw, value_raw) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key_raw)?.to_ascii_lowercase();
        let value = percent_decode(value_raw)?;
        if value.trim().is_empty() {
            continue;
        }

        match key.as_str() {
            "secret" => secret_base32 = Some(value),
            "issuer" => issuer_from_query = Some(value),
            "algorithm" => algorithm = value.parse::<TotpAlgorithm>()?,
            "digits" => {
                digits = value.parse::<u8>().map_err(|_| {
                    CryptexError::InvalidInput("TOTP digits must be numeric".to_string())
                })?;
            }
            "period" => {
                period = value.parse::<u32>().map_err(|_| {
                    CryptexError::InvalidInput("TOTP period must be numeric".to_string())
                })?;
            }
            _ => {}
        }
    }

    validate_parameters(digits, period)?;

    let secret = secret_base32.ok_or_else(|| {
        CryptexError::InvalidInput("TOTP URI is missing secret parameter".to_string())
    })?;
    let secret = normalize_secret(&secret)?;

    if let (Some(label_issuer), Some(query_issuer)) = (&issuer_from_label, &issuer_from_query) {
        if !label_issuer.eq_ignore_ascii_case(query_issuer) {
            return Err(CryptexError::InvalidInput(
                "Issuer in label does not match issuer query parameter".to_string(),
            ));
        }
    }

    Ok(ParsedTotpUri {
        secret_base32: secret,
        algorithm,
        digits,
        period,
        issuer: issuer_from_query.or(issuer_from_label),
        account_name,
    })
}

/// Generate a TOTP code for the given unix timestamp.
pub fn generate_totp_code(
    secret_base32: &str,
    algorithm: TotpAlgorithm,
    digits: u8,
    period: u32,
    timestamp: i64,
) -> Result<String> {
    validate_parameters(digits, period)?;

    let secret = decode_secret(secret_base32)?;
    let counter = (timestamp.max(0) as u64) / period as u64;
    let counter_bytes = counter.to_be_bytes();

    let digest = match algorithm {
        TotpAlgorithm::Sha1 => hmac_digest::<HmacSha1>(&secret, &counter_bytes)?,
        TotpAlgorithm::Sha256 => hmac_digest::<HmacSha256>(&secret, &counter_bytes)?,
        TotpAlgorithm::Sha512 => hmac_digest::<HmacSha512>(&secret, &counter_bytes)?,
    };

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    if offset + 3 >= digest.len() {
        return Err(CryptexError::InvalidInput(
            "Invalid TOTP digest offset".to_string(),
        ));
    }

    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let modulo = 10u32.pow(digits as u32);
    let code = binary % modulo;
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Get remaining seconds until the next TOTP rotation.
pub fn seconds_remaining(period: u32, timestamp: i64) -> u32 {
    if period == 0 {
        return 0;
    }

    let elapsed = timestamp.rem_euclid(period as i64) as u32;
    if elapsed == 0 {
        period
    } else {
        period - elapsed
    }
}

/// Uppercase, strip spaces and dashes, and check the secret decodes.
pub fn normalize_secret(secret_base32: &str) -> Result<String> {
    let normalized = secret_base32
        .trim()
        .replace([' ', '-'], "")
        .to_ascii_uppercase();

    if normalized.is_empty() {
        return Err(CryptexError::InvalidInput(
            "TOTP secret cannot be empty".to_string(),
        ));
    }

    decode_secret(&normalized)?;
    Ok(normalized)
}

pub(crate) fn validate_parameters(digits: u8, period: u32) -> Result<()> {
    if digits != 6 && digits != 8 {
        return Err(CryptexError::InvalidInput(
            "TOTP digits must be 6 or 8".to_string(),
        ));
    }
    if period == 0 {
        return Err(CryptexError::InvalidInput(
            "TOTP period must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn hmac_digest<M: Mac + KeyInit>(secret: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(secret)
        .map_err(|_| CryptexError::InvalidInput("Invalid TOTP secret".to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_secret(secret_base32: &str) -> Result<Vec<u8>> {
    let normalized = secret_base32
        .trim()
        .replace([' ', '-'], "")
        .to_ascii_uppercase();

    let decoded = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .or_else(|_| BASE32.decode(normalized.as_bytes()))
        .map_err(|_| CryptexError::InvalidInput("TOTP secret must be valid base32".to_string()))?;

    if decoded.is_empty() {
        return Err(CryptexError::InvalidInput(
            "TOTP secret cannot decode to empty bytes".to_string(),
        ));
    }

    Ok(decoded)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn percent_decode(input: &str) -> Result<String> {
    fn from_hex(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let invalid = || CryptexError::InvalidInput("Invalid percent encoding in TOTP URI".to_string());

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 3 > bytes.len() {
                    return Err(invalid());
                }
                let hi = from_hex(bytes[i + 1]).ok_or_else(invalid)?;
                let lo = from_hex(bytes[i + 2]).ok_or_else(invalid)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8(out)
        .map_err(|_| CryptexError::InvalidInput("TOTP URI contains invalid UTF-8".to_string()))
}
