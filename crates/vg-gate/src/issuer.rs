//! Access grant issuance and signing.
//!
//! Token format: `base64url(claims JSON) "." base64url(HMAC-SHA256(key, claims JSON))`,
//! both unpadded. Claims serialize in struct field order, so the signed bytes
//! are stable for a given grant.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{GateError, GateResult};
use crate::store::{GrantInsert, GrantStore};
use crate::types::{plus, AccessGrant, GateSession, SessionId, SubjectId};

type HmacSha256 = Hmac<Sha256>;

const MIN_KEY_LEN: usize = 16;

pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(900);
pub const DEFAULT_GRANT_SCOPE: &str = "vault:access";

/// Signed payload of a grant token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub grant_id: Uuid,
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    pub scope: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenClaims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// GrantSigner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct GrantSigner {
    key: Vec<u8>,
}

impl GrantSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> anyhow::Result<Self> {
        let key = key.into();
        if key.len() < MIN_KEY_LEN {
            bail!("grant signing key must be at least {MIN_KEY_LEN} bytes (got {})", key.len());
        }
        Ok(Self { key })
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length; the length check above is policy.
        match HmacSha256::new_from_slice(&self.key) {
            Ok(m) => m,
            Err(_) => unreachable!("hmac accepts any key length"),
        }
    }

    pub fn sign(&self, claims: &TokenClaims) -> anyhow::Result<String> {
        let body = serde_json::to_vec(claims).context("serialize token claims")?;
        let mut mac = self.mac();
        mac.update(&body);
        let tag = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Check the MAC (constant time) and decode the claims.
    ///
    /// Expiry is not checked here; see [`TokenClaims::is_expired`].
    pub fn verify(&self, token: &str) -> anyhow::Result<TokenClaims> {
        let (body_b64, tag_b64) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow!("token is not of the form <claims>.<mac>"))?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .context("token claims are not base64url")?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .context("token mac is not base64url")?;

        let mut mac = self.mac();
        mac.update(&body);
        mac.verify_slice(&tag)
            .map_err(|_| anyhow!("token signature mismatch"))?;

        serde_json::from_slice(&body).context("token claims are not valid JSON")
    }
}

impl std::fmt::Debug for GrantSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantSigner").field("key", &"<REDACTED>").finish()
    }
}

// ---------------------------------------------------------------------------
// AccessTokenIssuer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct AccessTokenIssuer {
    signer: GrantSigner,
    ttl: Duration,
    scope: Vec<String>,
}

impl AccessTokenIssuer {
    pub fn new(signer: GrantSigner, ttl: Duration, scope: Vec<String>) -> Self {
        Self { signer, ttl, scope }
    }

    /// Read `gate.grant_ttl_secs` and `gate.grant_scope`, falling back to defaults.
    pub fn from_config_json(cfg: &Value, signer: GrantSigner) -> anyhow::Result<Self> {
        let ttl = match cfg.pointer("/gate/grant_ttl_secs") {
            None | Some(Value::Null) => DEFAULT_GRANT_TTL,
            Some(v) => match v.as_u64() {
                Some(n) if n > 0 => Duration::from_secs(n),
                _ => bail!("gate.grant_ttl_secs must be a positive integer (got {v})"),
            },
        };
        let scope = match cfg.pointer("/gate/grant_scope") {
            None | Some(Value::Null) => vec![DEFAULT_GRANT_SCOPE.to_string()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|s| {
                    s.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow!("gate.grant_scope entries must be strings"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            Some(v) => bail!("gate.grant_scope must be a list of strings (got {v})"),
        };
        if scope.is_empty() {
            bail!("gate.grant_scope must not be empty");
        }
        Ok(Self::new(signer, ttl, scope))
    }

    pub fn signer(&self) -> &GrantSigner {
        &self.signer
    }

    /// Issue the grant for a completed session, at most once.
    ///
    /// A repeated call for the same session returns the grant already stored.
    pub async fn issue<G>(&self, session: &GateSession, now: DateTime<Utc>, store: &G) -> GateResult<AccessGrant>
    where
        G: GrantStore + ?Sized,
    {
        let claims = TokenClaims {
            grant_id: Uuid::new_v4(),
            session_id: session.session_id,
            subject_id: session.subject_id.clone(),
            scope: self.scope.clone(),
            issued_at: now,
            expires_at: plus(now, self.ttl),
        };
        let token = self.signer.sign(&claims).map_err(GateError::Store)?;
        let grant = AccessGrant {
            grant_id: claims.grant_id,
            session_id: claims.session_id,
            subject_id: claims.subject_id,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
            scope: claims.scope,
            token,
        };

        match store
            .insert_grant_if_absent(&grant)
            .await
            .map_err(GateError::Store)?
        {
            GrantInsert::Inserted => Ok(grant),
            GrantInsert::Conflict => store
                .load_grant(session.session_id)
                .await
                .map_err(GateError::Store)?
                .ok_or(GateError::DuplicateIssuance(session.session_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn signer() -> GrantSigner {
        GrantSigner::new(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap()
    }

    fn session() -> GateSession {
        GateSession::new(
            SubjectId::new("admin"),
            Value::Null,
            Utc::now(),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn short_key_rejected() {
        assert!(GrantSigner::new(b"short".to_vec()).is_err());
    }

    #[tokio::test]
    async fn issued_token_verifies_and_carries_claims() {
        let issuer = AccessTokenIssuer::new(signer(), Duration::from_secs(60), vec!["vault:admin".into()]);
        let store = MemoryStore::new();
        let s = session();
        let now = Utc::now();
        let g = issuer.issue(&s, now, &store).await.unwrap();

        let claims = issuer.signer().verify(&g.token).unwrap();
        assert_eq!(claims.grant_id, g.grant_id);
        assert_eq!(claims.session_id, s.session_id);
        assert_eq!(claims.scope, vec!["vault:admin".to_string()]);
        assert_eq!(g.expires_at, now + chrono::Duration::seconds(60));
        assert!(!claims.is_expired(now));
        assert!(claims.is_expired(g.expires_at));
    }

    #[tokio::test]
    async fn second_issue_returns_stored_grant() {
        let issuer = AccessTokenIssuer::new(signer(), DEFAULT_GRANT_TTL, vec![DEFAULT_GRANT_SCOPE.into()]);
        let store = MemoryStore::new();
        let s = session();
        let a = issuer.issue(&s, Utc::now(), &store).await.unwrap();
        let b = issuer.issue(&s, Utc::now(), &store).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.grant_count(), 1);
    }

    #[test]
    fn tampered_token_rejected() {
        let s = signer();
        let claims = TokenClaims {
            grant_id: Uuid::new_v4(),
            session_id: SessionId::new(),
            subject_id: SubjectId::new("admin"),
            scope: vec!["vault:access".into()],
            issued_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let token = s.sign(&claims).unwrap();
        let (_, tag) = token.split_once('.').unwrap();

        let mut forged = claims.clone();
        forged.scope = vec!["vault:root".into()];
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        assert!(s.verify(&format!("{forged_body}.{tag}")).is_err());

        let other = GrantSigner::new(b"ffffffffffffffffffffffffffffffff".to_vec()).unwrap();
        assert!(other.verify(&token).is_err());
        assert!(s.verify("no-dot").is_err());
        assert_eq!(s.verify(&token).unwrap(), claims);
    }

    /// Store that claims a conflict but never has anything to read back.
    struct LyingStore;

    #[async_trait]
    impl GrantStore for LyingStore {
        async fn insert_grant_if_absent(&self, _: &AccessGrant) -> anyhow::Result<GrantInsert> {
            Ok(GrantInsert::Conflict)
        }
        async fn load_grant(&self, _: SessionId) -> anyhow::Result<Option<AccessGrant>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn conflict_without_readback_is_duplicate_issuance() {
        let issuer = AccessTokenIssuer::new(signer(), DEFAULT_GRANT_TTL, vec![DEFAULT_GRANT_SCOPE.into()]);
        let s = session();
        match issuer.issue(&s, Utc::now(), &LyingStore).await {
            Err(GateError::DuplicateIssuance(id)) => assert_eq!(id, s.session_id),
            other => panic!("expected DuplicateIssuance, got {other:?}"),
        }
    }

    #[test]
    fn config_overrides_and_validation() {
        let i = AccessTokenIssuer::from_config_json(
            &json!({"gate": {"grant_ttl_secs": 120, "grant_scope": ["vault:admin", "vault:read"]}}),
            signer(),
        )
        .unwrap();
        assert_eq!(i.ttl, Duration::from_secs(120));
        assert_eq!(i.scope.len(), 2);

        let d = AccessTokenIssuer::from_config_json(&json!({}), signer()).unwrap();
        assert_eq!(d.ttl, DEFAULT_GRANT_TTL);
        assert_eq!(d.scope, vec![DEFAULT_GRANT_SCOPE.to_string()]);

        assert!(AccessTokenIssuer::from_config_json(&json!({"gate": {"grant_scope": []}}), signer()).is_err());
        assert!(AccessTokenIssuer::from_config_json(&json!({"gate": {"grant_ttl_secs": 0}}), signer()).is_err());
    }
}
