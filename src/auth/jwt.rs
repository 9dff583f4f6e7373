//! JWT Token Service
//! Mission: Issue, verify, refresh and revoke signed session credentials
//!
//! Credentials are HMAC-signed JWTs. Expiry is checked against the injected
//! [`Clock`](crate::clock::Clock), not by `jsonwebtoken`'s own wall-clock check.
//! Revoked credentials sit in a blacklist until their own `exp` passes; the
//! reclamation task bounds its size, so the cleanup interval trades memory
//! for CPU.

use crate::auth::models::{
    Claims, CredentialPair, CredentialType, EXP_CLAIM, IAT_CLAIM, ID_CLAIM, JTI_CLAIM,
    RESERVED_CLAIMS, TYPE_CLAIM,
};
use crate::clock::{span, SharedClock};
use crate::config::TokenServiceConfig;
use crate::error::{ConfigError, TokenError};
use crate::reclaim::Reclaimer;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct TokenState {
    /// Revoked credential -> its own expiry (None when undecodable)
    blacklist: HashMap<String, Option<DateTime<Utc>>>,
    /// Principal -> credentials issued to it, with their expiries
    principals: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

#[derive(Default)]
struct AutoRefreshSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl AutoRefreshSlot {
    fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Live entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenStats {
    pub revoked: usize,
    pub principals: usize,
    pub indexed_credentials: usize,
}

/// Entries removed by one reclamation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenReclaimed {
    pub revoked: usize,
    pub credentials: usize,
    pub principals: usize,
}

/// Issues and validates access/refresh credential pairs.
pub struct TokenService {
    config: TokenServiceConfig,
    clock: SharedClock,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    state: Mutex<TokenState>,
    auto_refresh: Arc<Mutex<AutoRefreshSlot>>,
    reclaimer: Reclaimer,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TokenService {
    /// Create a token service without a background reclamation task.
    pub fn new(config: TokenServiceConfig, clock: SharedClock) -> Result<Self, TokenError> {
        config.validate()?;

        let secret = config.secret.as_bytes();
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            config,
            clock,
            state: Mutex::new(TokenState::default()),
            auto_refresh: Arc::new(Mutex::new(AutoRefreshSlot::default())),
            reclaimer: Reclaimer::new(),
        })
    }

    /// Create a token service and start its reclamation task.
    pub fn spawn(config: TokenServiceConfig, clock: SharedClock) -> Result<Arc<Self>, TokenError> {
        let service = Arc::new(Self::new(config, clock)?);
        service.reclaimer.start(
            "token-service",
            service.config.cleanup_interval(),
            &service,
            |s: &TokenService| {
                s.reclaim();
            },
        );
        Ok(service)
    }

    pub fn config(&self) -> &TokenServiceConfig {
        &self.config
    }

    /// Issue an access credential carrying `claims` and a refresh credential
    /// carrying only `principal_id`. Both are indexed under `principal_id`.
    pub fn issue_credentials(
        &self,
        claims: Claims,
        principal_id: &str,
    ) -> Result<CredentialPair, TokenError> {
        let now = self.clock.now();

        let mut access_claims = claims;
        for key in RESERVED_CLAIMS {
            if access_claims.remove(key).is_some() {
                debug!(claim = key, "Overwriting caller-supplied reserved claim");
            }
        }
        let (access_token, access_exp) = self.sign(
            access_claims,
            CredentialType::Access,
            now,
            self.config.access_expiry(),
        )?;

        let refresh_claims = Claims::new().with(ID_CLAIM, principal_id);
        let (refresh_token, refresh_exp) = self.sign(
            refresh_claims,
            CredentialType::Refresh,
            now,
            self.config.refresh_expiry(),
        )?;

        {
            let mut state = self.state.lock();
            let issued = state.principals.entry(principal_id.to_string()).or_default();
            issued.insert(access_token.clone(), access_exp);
            issued.insert(refresh_token.clone(), refresh_exp);
        }

        debug!(
            principal = %principal_id,
            access_expires_at = %access_exp,
            "Issued credential pair"
        );

        Ok(CredentialPair {
            access_token,
            refresh_token,
            expires_at: access_exp,
        })
    }

    fn sign(
        &self,
        mut claims: Claims,
        kind: CredentialType,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        // exp is whole seconds on the wire; report what a verifier will decode
        let exp = now
            .checked_add_signed(span(ttl))
            .ok_or_else(|| ConfigError::Invalid {
                key: "tokens.expiry",
                reason: format!("{}s lifetime overflows the timestamp range", ttl.as_secs()),
            })?
            .timestamp();
        let expires_at = DateTime::<Utc>::from_timestamp(exp, 0).ok_or(TokenError::InvalidCredential)?;

        claims.insert(TYPE_CLAIM, kind.as_str());
        claims.insert(IAT_CLAIM, now.timestamp());
        claims.insert(EXP_CLAIM, exp);
        claims.insert(JTI_CLAIM, Uuid::new_v4().to_string());

        let token = encode(
            &Header::new(self.config.algorithm),
            &claims,
            &self.encoding_key,
        )
        .map_err(TokenError::Signing)?;

        Ok((token, expires_at))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.config.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::from([EXP_CLAIM.to_string()]);
        validation
    }

    /// Verify a credential and return its claims. Revocation is checked
    /// before signature and expiry.
    pub fn verify(&self, credential: &str) -> Result<Claims, TokenError> {
        if self.is_revoked(credential) {
            warn!("Revoked credential presented");
            return Err(TokenError::Revoked);
        }

        let decoded = decode::<Claims>(credential, &self.decoding_key, &self.validation())
            .map_err(|e| {
                debug!(error = %e, "Credential rejected");
                match e.kind() {
                    ErrorKind::ExpiredSignature => TokenError::Expired,
                    _ => TokenError::Malformed,
                }
            })?;

        let claims = decoded.claims;
        let expires_at = claims.expires_at().ok_or(TokenError::Malformed)?;
        if self.clock.now() >= expires_at {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Exchange a refresh credential for a new pair. The new access
    /// credential carries only the principal id, not the original claims.
    pub fn refresh_credentials(&self, refresh_credential: &str) -> Result<CredentialPair, TokenError> {
        let claims = self.verify_refresh(refresh_credential)?;
        self.reissue_for(&claims)
    }

    /// Like [`refresh_credentials`](Self::refresh_credentials), but spends the
    /// refresh credential: it is blacklisted under the same lock that checks
    /// it, so concurrent redemptions of one credential yield one pair.
    pub fn redeem_refresh_credentials(&self, refresh_credential: &str) -> Result<CredentialPair, TokenError> {
        let claims = self.verify_refresh(refresh_credential)?;
        {
            let mut state = self.state.lock();
            if state.blacklist.contains_key(refresh_credential) {
                warn!("Refresh credential redeemed twice");
                return Err(TokenError::Revoked);
            }
            state
                .blacklist
                .insert(refresh_credential.to_string(), claims.expires_at());
        }
        self.reissue_for(&claims)
    }

    fn verify_refresh(&self, refresh_credential: &str) -> Result<Claims, TokenError> {
        let claims = self.verify(refresh_credential)?;

        let found = claims.credential_type();
        if found != Some(CredentialType::Refresh) {
            return Err(TokenError::WrongCredentialType {
                expected: CredentialType::Refresh,
                found,
            });
        }
        Ok(claims)
    }

    fn reissue_for(&self, refresh_claims: &Claims) -> Result<CredentialPair, TokenError> {
        let principal_id = refresh_claims.principal_id().ok_or(TokenError::Malformed)?;
        debug!(principal = %principal_id, "Refreshing credentials");

        self.issue_credentials(Claims::new().with(ID_CLAIM, principal_id), principal_id)
    }

    /// Blacklist a credential. Idempotent.
    pub fn revoke(&self, credential: &str) {
        let expires_at = self.peek_expiry(credential);
        let mut state = self.state.lock();
        if state.blacklist.insert(credential.to_string(), expires_at).is_none() {
            info!("Credential revoked");
        }
    }

    /// Blacklist every credential issued to `principal_id`. Returns how many
    /// were newly revoked; unknown principals are a no-op.
    pub fn revoke_all_for_principal(&self, principal_id: &str) -> usize {
        let mut state = self.state.lock();
        let TokenState {
            blacklist,
            principals,
        } = &mut *state;

        let Some(issued) = principals.get(principal_id) else {
            return 0;
        };

        let mut revoked = 0;
        for (credential, expires_at) in issued {
            if blacklist
                .insert(credential.clone(), Some(*expires_at))
                .is_none()
            {
                revoked += 1;
            }
        }

        info!(principal = %principal_id, revoked, "Revoked all credentials for principal");
        revoked
    }

    pub fn is_revoked(&self, credential: &str) -> bool {
        self.state.lock().blacklist.contains_key(credential)
    }

    /// Decode `exp` without checking the signature.
    pub fn peek_expiry(&self, credential: &str) -> Option<DateTime<Utc>> {
        let mut validation = Validation::new(self.config.algorithm);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.algorithms = vec![
            Algorithm::HS256,
            Algorithm::HS384,
            Algorithm::HS512,
            self.config.algorithm,
        ];
        validation.required_spec_claims = HashSet::from([EXP_CLAIM.to_string()]);

        decode::<Claims>(credential, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .and_then(|data| data.claims.expires_at())
    }

    /// Invoke `callback` once, `refresh_threshold` before the credential
    /// expires (immediately if that moment has passed). Replaces any
    /// previously scheduled callback. Returns the delay used.
    pub fn schedule_auto_refresh<F>(&self, credential: &str, callback: F) -> Result<Duration, TokenError>
    where
        F: FnOnce() + Send + 'static,
    {
        let expires_at = self.peek_expiry(credential).ok_or(TokenError::InvalidCredential)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TokenError::NoRuntime)?;

        let delay = (expires_at - self.clock.now())
            .checked_sub(&span(self.config.refresh_threshold()))
            .and_then(|lead| lead.to_std().ok())
            .unwrap_or(Duration::ZERO);

        let mut slot = self.auto_refresh.lock();
        slot.cancel();
        let generation = slot.generation;
        let shared = Arc::clone(&self.auto_refresh);

        slot.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = shared.lock();
                if slot.generation != generation {
                    return;
                }
                // claim the firing: a later cancel sees no handle and a new generation
                slot.generation = slot.generation.wrapping_add(1);
                slot.handle = None;
            }
            debug!("Auto-refresh firing");
            callback();
        }));

        debug!(delay_ms = delay.as_millis() as u64, "Auto-refresh scheduled");
        Ok(delay)
    }

    /// Cancel the pending auto-refresh, if any.
    pub fn cancel_auto_refresh(&self) -> bool {
        self.auto_refresh.lock().cancel()
    }

    pub fn has_pending_auto_refresh(&self) -> bool {
        self.auto_refresh
            .lock()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Drop expired blacklist entries and expired indexed credentials.
    pub fn reclaim(&self) -> TokenReclaimed {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut reclaimed = TokenReclaimed::default();

        let before = state.blacklist.len();
        state
            .blacklist
            .retain(|_, expires_at| expires_at.is_some_and(|exp| exp > now));
        reclaimed.revoked = before - state.blacklist.len();

        state.principals.retain(|_, issued| {
            let before = issued.len();
            issued.retain(|_, exp| *exp > now);
            reclaimed.credentials += before - issued.len();
            if issued.is_empty() {
                reclaimed.principals += 1;
                false
            } else {
                true
            }
        });

        if reclaimed != TokenReclaimed::default() {
            debug!(
                revoked = reclaimed.revoked,
                credentials = reclaimed.credentials,
                principals = reclaimed.principals,
                "Reclaimed expired credential state"
            );
        }
        reclaimed
    }

    pub fn stats(&self) -> TokenStats {
        let state = self.state.lock();
        TokenStats {
            revoked: state.blacklist.len(),
            principals: state.principals.len(),
            indexed_credentials: state.principals.values().map(HashMap::len).sum(),
        }
    }

    /// Stop reclamation, cancel auto-refresh, clear all state. Idempotent.
    pub fn shutdown(&self) {
        self.reclaimer.stop();
        self.cancel_auto_refresh();
        let mut state = self.state.lock();
        state.blacklist.clear();
        state.principals.clear();
    }
}
