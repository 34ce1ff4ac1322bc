// proxy-server/src/auth.rs
use actix_web::HttpRequest;
use proxy_common::{AuthMode, Identity, TokenVerifier};

use crate::error::ProxyError;

/// Read the session cookie and classify the request
pub fn identify(req: &HttpRequest, verifier: &TokenVerifier, cookie_name: &str) -> Identity {
    let cookie = req.cookie(cookie_name);
    verifier.identify(cookie.as_ref().map(|c| c.value()))
}

/// Decide whether a request may be forwarded.
///
/// In permissive mode every identity passes and the outcome is only
/// logged. In enforce mode anything but a verified token is rejected.
pub fn authorize(identity: &Identity, mode: AuthMode) -> Result<(), ProxyError> {
    match (mode, identity) {
        (AuthMode::Permissive, _) | (_, Identity::Authenticated(_)) => Ok(()),
        (AuthMode::Enforce, Identity::Anonymous) => {
            Err(ProxyError::Unauthorized("no session token".to_string()))
        }
        (AuthMode::Enforce, Identity::Invalid(err)) => {
            Err(ProxyError::Unauthorized(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use proxy_common::{TokenError, TokenSigner};

    const SECRET: &[u8] = b"auth-test-secret";

    #[test]
    fn test_cookie_token_is_verified() {
        let signer = TokenSigner::new(SECRET, chrono::Duration::hours(1));
        let verifier = TokenVerifier::new(SECRET, 0);
        let token = signer.issue("jd1234", None).unwrap();

        let req = TestRequest::default()
            .insert_header(("cookie", format!("theme=dark; token={}", token)))
            .to_http_request();

        assert_eq!(identify(&req, &verifier, "token").subject(), Some("jd1234"));
    }

    #[test]
    fn test_other_cookies_are_anonymous() {
        let verifier = TokenVerifier::new(SECRET, 0);
        let req = TestRequest::default()
            .insert_header(("cookie", "theme=dark"))
            .to_http_request();

        assert_eq!(identify(&req, &verifier, "token"), Identity::Anonymous);
    }

    #[test]
    fn test_permissive_lets_everything_through() {
        assert!(authorize(&Identity::Anonymous, AuthMode::Permissive).is_ok());
        assert!(authorize(
            &Identity::Invalid(TokenError::Expired),
            AuthMode::Permissive
        )
        .is_ok());
    }

    #[test]
    fn test_enforce_rejects_missing_and_invalid() {
        assert!(matches!(
            authorize(&Identity::Anonymous, AuthMode::Enforce),
            Err(ProxyError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize(&Identity::Invalid(TokenError::BadSignature), AuthMode::Enforce),
            Err(ProxyError::Unauthorized(_))
        ));
    }
}
