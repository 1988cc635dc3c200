//! JWT session token creation and verification, and the session cookie.

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::{config::Config, db::models::members::MemberDBResponse, errors::Error, types::MemberId};

/// JWT session claims. Only the identity is carried: the member is reloaded on every request so
/// that deactivation and permission changes apply immediately.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: MemberId,
    pub username: String,
    pub is_superuser: bool,
    pub exp: i64,
    pub iat: i64,
}

impl SessionClaims {
    pub fn new(member: &MemberDBResponse, config: &Config) -> Self {
        let now = Utc::now();
        let exp = now + config.auth.security.jwt_expiry;

        Self {
            sub: member.id,
            username: member.username.clone(),
            is_superuser: member.is_superuser,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        }
    }
}

fn secret(config: &Config) -> Result<&[u8], Error> {
    config
        .secret_key
        .as_deref()
        .map(str::as_bytes)
        .ok_or_else(|| Error::Internal {
            operation: "JWT sessions: secret_key is required".to_string(),
        })
}

/// Create a JWT token for a member session
pub fn create_session_token(member: &MemberDBResponse, config: &Config) -> Result<String, Error> {
    let claims = SessionClaims::new(member, config);
    let key = EncodingKey::from_secret(secret(config)?);
    encode(&Header::default(), &claims, &key).map_err(|e| Error::Internal {
        operation: format!("create JWT: {e}"),
    })
}

/// Verify and decode a JWT session token
pub fn verify_session_token(token: &str, config: &Config) -> Result<SessionClaims, Error> {
    let key = DecodingKey::from_secret(secret(config)?);

    let token_data = decode::<SessionClaims>(token, &key, &Validation::default()).map_err(|e| match e.kind() {
        // Client errors (401)
        ErrorKind::InvalidToken
        | ErrorKind::InvalidSignature
        | ErrorKind::ExpiredSignature
        | ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidSubject
        | ErrorKind::ImmatureSignature
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::InvalidAlgorithm => Error::Unauthenticated { message: None },
        // Key problems are ours
        _ => Error::Internal {
            operation: format!("JWT verification: {e}"),
        },
    })?;

    Ok(token_data.claims)
}

/// `Set-Cookie` value carrying a session token
pub fn session_cookie(token: &str, config: &Config) -> String {
    let session = &config.auth.native.session;
    let max_age = config.auth.security.jwt_expiry.as_secs();
    let secure = if session.cookie_secure { "; Secure" } else { "" };

    format!(
        "{}={}; Path=/; HttpOnly{}; SameSite={}; Max-Age={}",
        session.cookie_name,
        token,
        secure,
        same_site(&session.cookie_same_site),
        max_age
    )
}

/// `Set-Cookie` value that clears the session
pub fn expired_cookie(config: &Config) -> String {
    let session = &config.auth.native.session;
    let secure = if session.cookie_secure { "; Secure" } else { "" };
    format!(
        "{}=; Path=/; HttpOnly{}; SameSite={}; Max-Age=0",
        session.cookie_name,
        secure,
        same_site(&session.cookie_same_site)
    )
}

fn same_site(value: &str) -> &'static str {
    match value.to_ascii_lowercase().as_str() {
        "lax" => "Lax",
        "none" => "None",
        _ => "Strict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_config;
    use uuid::Uuid;

    fn member() -> MemberDBResponse {
        MemberDBResponse {
            id: Uuid::new_v4(),
            username: "jdoe".to_string(),
            email: Some("jdoe@example.com".to_string()),
            phone: None,
            first_name: "John".to_string(),
            last_name: "Doe".to_string(),
            full_name: "John Doe".to_string(),
            gender: None,
            dob: None,
            language: "en".to_string(),
            password_hash: None,
            is_ghost: false,
            is_iao: false,
            is_staff: false,
            is_superuser: false,
            is_active: true,
            email_verified: false,
            phone_verified: false,
            date_joined: Utc::now(),
            last_login: None,
        }
    }

    #[test]
    fn test_create_and_verify_session_token() {
        let config = create_test_config();
        let member = member();

        let token = create_session_token(&member, &config).unwrap();
        let claims = verify_session_token(&token, &config).unwrap();

        assert_eq!(claims.sub, member.id);
        assert_eq!(claims.username, "jdoe");
        assert!(!claims.is_superuser);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_verify_token_wrong_secret() {
        let mut config = create_test_config();
        let token = create_session_token(&member(), &config).unwrap();

        config.secret_key = Some("different-secret".to_string());
        let result = verify_session_token(&token, &config);
        assert!(matches!(result, Err(Error::Unauthenticated { .. })));
    }

    #[test]
    fn test_verify_expired_token() {
        let config = create_test_config();
        let now = Utc::now();
        let claims = SessionClaims {
            sub: Uuid::new_v4(),
            username: "jdoe".to_string(),
            is_superuser: false,
            exp: (now - chrono::Duration::hours(1)).timestamp(),
            iat: (now - chrono::Duration::hours(2)).timestamp(),
        };
        let key = EncodingKey::from_secret(config.secret_key.as_ref().unwrap().as_bytes());
        let token = encode(&Header::default(), &claims, &key).unwrap();

        assert!(matches!(verify_session_token(&token, &config), Err(Error::Unauthenticated { .. })));
    }

    #[test]
    fn test_verify_malformed_token() {
        let config = create_test_config();
        for token in ["not.a.token", "invalid", "", "too.many.parts.in.this.token"] {
            assert!(
                matches!(verify_session_token(token, &config), Err(Error::Unauthenticated { .. })),
                "Expected Unauthenticated error for token: {token}"
            );
        }
    }

    #[test]
    fn test_cookies() {
        let mut config = create_test_config();
        config.auth.native.session.cookie_same_site = "lax".to_string();

        let cookie = session_cookie("abc", &config);
        assert!(cookie.starts_with(&format!("{}=abc;", config.auth.native.session.cookie_name)));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));

        config.auth.native.session.cookie_secure = false;
        let cleared = expired_cookie(&config);
        assert!(cleared.contains("Max-Age=0"));
        assert!(!cleared.contains("Secure"));
    }
}
