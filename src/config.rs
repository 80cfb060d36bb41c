use std::env;

use anyhow::{bail, Context};

use crate::codec::SecretMaterial;
use crate::constants::{DEFAULT_MAX_UPLOAD_MB, DEFAULT_STORAGE_PUBLIC_URL};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Origin shareable links and proxied image URLs are built on
    pub public_base_url: String,
    pub secrets: SecretMaterial,
    pub storage_dir: String,
    /// Prefix of every canonical storage URL
    pub storage_public_url: String,
    pub auth_users: Vec<(String, String)>,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; missing secrets or base URL are fatal.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secrets = SecretMaterial::from_hex(
            &lookup("ENCRYPTION_KEY").unwrap_or_default(),
            &lookup("ENCRYPTION_IV").unwrap_or_default(),
        )?;

        let public_base_url = lookup("PUBLIC_BASE_URL").context("PUBLIC_BASE_URL is missing")?;
        let public_base_url = normalize_base_url("PUBLIC_BASE_URL", &public_base_url)?;

        let storage_public_url = lookup("STORAGE_PUBLIC_URL")
            .unwrap_or_else(|| DEFAULT_STORAGE_PUBLIC_URL.to_string());
        let storage_public_url = normalize_base_url("STORAGE_PUBLIC_URL", &storage_public_url)?;

        let max_upload_mb: usize = lookup("MAX_UPLOAD_MB")
            .unwrap_or_else(|| DEFAULT_MAX_UPLOAD_MB.to_string())
            .parse()
            .context("MAX_UPLOAD_MB must be a whole number")?;
        let max_upload_bytes = max_upload_mb
            .checked_mul(1024 * 1024)
            .with_context(|| format!("MAX_UPLOAD_MB {} is too large", max_upload_mb))?;

        Ok(Self {
            port: lookup("PORT")
                .unwrap_or_else(|| "8080".to_string())
                .parse()
                .context("PORT must be a valid port number")?,
            public_base_url,
            secrets,
            storage_dir: lookup("STORAGE_DIR").unwrap_or_else(|| "./storage".to_string()),
            storage_public_url,
            auth_users: parse_auth_users(&lookup("AUTH_USERS").unwrap_or_default())?,
            max_upload_bytes,
        })
    }
}

fn normalize_base_url(name: &str, value: &str) -> anyhow::Result<String> {
    let trimmed = value.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        bail!("{} must be an http(s) URL, got {:?}", name, value);
    }
    Ok(trimmed.to_string())
}

pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse `uid:secret,uid2:secret2`.
fn parse_auth_users(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (uid, secret) = entry
                .split_once(':')
                .with_context(|| format!("AUTH_USERS entry {:?} is not uid:secret", entry))?;
            if !is_valid_uid(uid) {
                bail!("AUTH_USERS uid {:?} may only contain letters, digits, '-' and '_'", uid);
            }
            if secret.is_empty() {
                bail!("AUTH_USERS entry for {:?} has an empty secret", uid);
            }
            Ok((uid.to_string(), secret.to_string()))
        })
        .collect()
}
