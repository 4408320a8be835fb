//! Remote JWKS key set with miss-triggered re-sync.
//!
//! Keys are fetched from the configured endpoint and cached; a lookup miss
//! on a token's `kid` triggers one re-sync before the token is rejected, so
//! key rotation on the issuer side does not require a gateway restart.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::StatusError;

/// Claims carried by gateway bearer tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub aud: Vec<String>,
    #[serde(default)]
    pub exp: Option<u64>,
    /// Map of scope name to access grant; decoded lazily by the authorizer.
    #[serde(default)]
    pub scopes: Option<serde_json::Value>,
}

impl Claims {
    /// The original encodes a single audience; multi-valued tokens compare
    /// against the concatenation.
    pub fn audience(&self) -> String {
        self.aud.concat()
    }
}

pub struct KeySet {
    endpoint: String,
    client: reqwest::Client,
    keys: RwLock<JwkSet>,
}

impl KeySet {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            keys: RwLock::new(JwkSet { keys: Vec::new() }),
        }
    }

    async fn sync(&self) -> Result<(), StatusError> {
        let fetched: JwkSet = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StatusError::unauthorized(format!("jwks sync failed: {e}")))?
            .json()
            .await
            .map_err(|e| StatusError::unauthorized(format!("jwks decode failed: {e}")))?;

        *self.keys.write().await = fetched;
        Ok(())
    }

    async fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        keys.find(kid).and_then(|jwk| DecodingKey::from_jwk(jwk).ok())
    }

    /// Verify signature and expiry; returns the decoded claims.
    pub async fn validate(&self, token: &str) -> Result<Claims, StatusError> {
        let header = decode_header(token)
            .map_err(|e| StatusError::unauthorized(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| StatusError::unauthorized("token has no key id"))?;

        let key = match self.lookup(&kid).await {
            Some(key) => key,
            None => {
                // One re-sync on a miss, then give up.
                self.sync().await?;
                self.lookup(&kid)
                    .await
                    .ok_or_else(|| StatusError::unauthorized("key id not exists"))?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => StatusError::unauthorized("token is expired"),
                _ => StatusError::unauthorized(format!("invalid token: {e}")),
            }
        })?;

        Ok(data.claims)
    }
}

fn string_or_seq<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    struct StringOrSeq;

    impl<'de> Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("string or sequence of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                out.push(s);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}
