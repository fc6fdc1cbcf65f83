use serde::{Deserialize, Serialize};

/// Container image reference: `repository[:tag]` or `repository@sha256:<digest>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub reference: ImageVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVersion {
    /// Mutable; resolves to whatever the registry points it at when a run starts.
    Tag(String),
    /// Content-addressed, hex without the `sha256:` prefix.
    Digest(String),
}

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("image reference is empty".to_string());
        }

        if let Some((repository, digest)) = raw.split_once('@') {
            let hex = digest
                .strip_prefix("sha256:")
                .ok_or_else(|| format!("unsupported digest algorithm in {raw}"))?;
            if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("malformed sha256 digest in {raw}"));
            }
            let repository = validate_repository(repository, raw)?;
            return Ok(Self {
                repository,
                reference: ImageVersion::Digest(hex.to_ascii_lowercase()),
            });
        }

        // A colon after the last slash separates the tag; one before it is a registry port.
        let last_slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match raw[last_slash..].rfind(':') {
            Some(i) => (&raw[..last_slash + i], &raw[last_slash + i + 1..]),
            None => (raw, "latest"),
        };
        if tag.is_empty() {
            return Err(format!("empty tag in {raw}"));
        }
        let repository = validate_repository(repository, raw)?;
        Ok(Self {
            repository,
            reference: ImageVersion::Tag(tag.to_string()),
        })
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.reference, ImageVersion::Digest(_))
    }
}

fn validate_repository(repository: &str, raw: &str) -> Result<String, String> {
    if repository.is_empty() || repository.starts_with('/') || repository.ends_with('/') {
        return Err(format!("malformed repository in {raw}"));
    }
    if repository.chars().any(char::is_whitespace) {
        return Err(format!("whitespace in image reference {raw}"));
    }
    Ok(repository.to_string())
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reference {
            ImageVersion::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            ImageVersion::Digest(hex) => write!(f, "{}@sha256:{}", self.repository, hex),
        }
    }
}
