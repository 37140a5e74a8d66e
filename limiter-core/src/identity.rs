//! Identity extraction: resolves `(tenant_id, user_id, endpoint,
//! ip_address)` from ordered sources.
//!
//! Bearer-token verification is optional (HMAC-SHA256 with a shared
//! secret); when no secret is configured, or verification fails,
//! claims are still decoded for identity purposes but are never
//! trusted for authorization.

use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims this system cares about, a subset of a JWT payload.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Claims {
    #[serde(alias = "tenantId")]
    pub tenant_id: Option<String>,
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    pub sub: Option<String>,
}

impl Claims {
    fn resolved_user_id(&self) -> Option<String> {
        self.user_id.clone().or_else(|| self.sub.clone())
    }
}

/// Outcome of bearer-token handling. `Decoded` carries claims that were
/// never cryptographically checked; callers MUST NOT treat them as an
/// authorization decision, only as advisory identity material.
#[derive(Debug, Clone)]
pub enum BearerClaims {
    Verified(Claims),
    Decoded(Claims),
    None,
}

impl BearerClaims {
    /// Verifies `token` against `secret` if one is configured, else
    /// falls back to an unverified base64 decode of the JWT payload
    /// segment.
    pub fn from_bearer(token: &str, secret: Option<&str>) -> Self {
        if let Some(secret) = secret {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = false;
            if let Ok(data) = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
                return BearerClaims::Verified(data.claims);
            }
        }
        match Self::decode_unverified(token) {
            Some(claims) => BearerClaims::Decoded(claims),
            None => BearerClaims::None,
        }
    }

    fn decode_unverified(token: &str) -> Option<Claims> {
        let payload = token.split('.').nth(1)?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn claims(&self) -> Option<&Claims> {
        match self {
            BearerClaims::Verified(c) | BearerClaims::Decoded(c) => Some(c),
            BearerClaims::None => None,
        }
    }
}

/// `(tenant_id, user_id, endpoint, ip_address?)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub tenant_id: String,
    pub user_id: String,
    pub endpoint: String,
    pub ip_address: Option<String>,
}

/// Raw material identity extraction is built from: a caller hands
/// whatever subset of ordered sources it has available, already
/// decoded from the underlying transport (transport parsing itself is
/// out of scope for this crate).
#[derive(Debug, Clone, Default)]
pub struct IdentitySources<'a> {
    pub bearer: Option<BearerClaims>,
    pub api_key: Option<&'a str>,
    pub tenant_header: Option<&'a str>,
    pub user_header: Option<&'a str>,
    pub ip_address: Option<&'a str>,
    pub raw_path: Option<&'a str>,
}

/// Normalises a request path into the canonical endpoint key: drop the
/// query string, trim a trailing slash, map non `[A-Za-z0-9/_-]` to
/// `_`.
pub fn normalise_endpoint(raw_path: &str) -> String {
    let without_query = raw_path.split('?').next().unwrap_or(raw_path);
    let trimmed = without_query.strip_suffix('/').unwrap_or(without_query);
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn sanitise_ip(ip: &str) -> String {
    ip.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

/// Resolves a `RequestIdentity` from ordered sources, or `None` when
/// the endpoint is missing or tenant/user remain empty after
/// normalisation — the decisioner treats `None` as a fail-open skip.
pub fn extract_identity(sources: &IdentitySources<'_>) -> Option<RequestIdentity> {
    let endpoint = sources.raw_path.map(normalise_endpoint)?;
    if endpoint.is_empty() {
        return None;
    }

    // 1. bearer token claims
    if let Some(bearer) = &sources.bearer {
        if let Some(claims) = bearer.claims() {
            if let (Some(tenant_id), Some(user_id)) =
                (claims.tenant_id.clone(), claims.resolved_user_id())
            {
                if !tenant_id.is_empty() && !user_id.is_empty() {
                    return Some(RequestIdentity {
                        tenant_id,
                        user_id,
                        endpoint,
                        ip_address: sources.ip_address.map(String::from),
                    });
                }
            }
        }
    }

    // 2. API-key header `tenant.user.secret`
    if let Some(api_key) = sources.api_key {
        let mut parts = api_key.splitn(3, '.');
        if let (Some(tenant_id), Some(user_id), Some(_secret)) =
            (parts.next(), parts.next(), parts.next())
        {
            if !tenant_id.is_empty() && !user_id.is_empty() {
                return Some(RequestIdentity {
                    tenant_id: tenant_id.to_string(),
                    user_id: user_id.to_string(),
                    endpoint,
                    ip_address: sources.ip_address.map(String::from),
                });
            }
        }
    }

    // 3. X-Tenant-ID / X-User-ID headers
    if let Some(tenant_id) = sources.tenant_header.filter(|t| !t.is_empty()) {
        let user_id = sources
            .user_header
            .filter(|u| !u.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "default".to_string());
        return Some(RequestIdentity {
            tenant_id: tenant_id.to_string(),
            user_id,
            endpoint,
            ip_address: sources.ip_address.map(String::from),
        });
    }

    // 4. IP-derived anonymous identity
    if let Some(ip) = sources.ip_address {
        return Some(RequestIdentity {
            tenant_id: "anonymous".to_string(),
            user_id: format!("ip_{}", sanitise_ip(ip)),
            endpoint,
            ip_address: Some(ip.to_string()),
        });
    }

    None
}
