use std::fmt;
use std::sync::Arc;

use crate::{
    Response,
    context::Context,
    http::BasicCredentials,
    middleware::{BoxResponseFuture, Middleware, Next},
};

type Validator = Arc<dyn Fn(&BasicCredentials) -> bool + Send + Sync>;

/// HTTP Basic authentication.
///
/// Requests without acceptable credentials are answered with `401` and
/// `WWW-Authenticate: Basic realm="<realm>"` (realm `Restricted` unless set).
/// Credentials are checked against the accounts added with
/// [`credentials`](Self::credentials), or by a custom
/// [`validator`](Self::validator) when one is installed.
///
/// On success the [`BasicCredentials`] are stored in the request extensions
/// for the handler.
///
/// ```rust,no_run
/// use evserve::security::BasicAuthMiddleware;
///
/// let auth = BasicAuthMiddleware::new()
///     .realm("Admin")
///     .credentials("admin", "s3cret");
/// ```
#[derive(Clone)]
pub struct BasicAuthMiddleware {
    realm: String,
    accounts: Vec<(String, String)>,
    validator: Option<Validator>,
}

impl fmt::Debug for BasicAuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthMiddleware")
            .field("realm", &self.realm)
            .field("accounts", &self.accounts.len())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Default for BasicAuthMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicAuthMiddleware {
    pub fn new() -> Self {
        Self {
            realm: "Restricted".to_string(),
            accounts: Vec::new(),
            validator: None,
        }
    }

    #[must_use]
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Accepts `username` / `password`. May be called repeatedly.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts.push((username.into(), password.into()));
        self
    }

    /// Replaces the account list with a custom check.
    #[must_use]
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&BasicCredentials) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    fn accepts(&self, credentials: &BasicCredentials) -> bool {
        if let Some(validator) = &self.validator {
            return validator(credentials);
        }
        // Every account is compared so timing does not reveal which one matched.
        self.accounts.iter().fold(false, |found, (user, pass)| {
            let user_ok = constant_time_eq(user.as_bytes(), credentials.username.as_bytes());
            let pass_ok = constant_time_eq(pass.as_bytes(), credentials.password.as_bytes());
            found | (user_ok & pass_ok)
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Middleware for BasicAuthMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponseFuture {
        let credentials = ctx
            .request()
            .basic_auth()
            .filter(|c| self.accepts(c))
            .cloned();

        match credentials {
            Some(credentials) => {
                ctx.extensions_mut().insert(credentials);
                next.run(ctx)
            }
            None => {
                tracing::debug!(
                    path = ctx.request().path(),
                    remote = %ctx.request().remote_addr(),
                    presented = ctx.request().basic_auth().is_some(),
                    "basic auth rejected"
                );
                let response = Response::unauthorized(&self.realm);
                Box::pin(async move { response })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::middleware::from_middleware;
    use crate::middleware::test_support::{ok_handler, request, run};
    use crate::router::Handler;

    // "admin:s3cret"
    const GOOD: &str = "YWRtaW46czNjcmV0";
    // "admin:wrong"
    const BAD: &str = "YWRtaW46d3Jvbmc=";

    fn with_auth(token: &str) -> Context {
        request(&format!(
            "GET /private HTTP/1.1\r\nAuthorization: Basic {token}\r\n\r\n"
        ))
    }

    fn auth() -> crate::middleware::MiddlewareHandler {
        from_middleware(Arc::new(
            BasicAuthMiddleware::new().credentials("admin", "s3cret"),
        ))
    }

    #[tokio::test]
    async fn wrong_password_gets_401_with_default_realm() {
        let res = run(vec![auth()], ok_handler(), with_auth(BAD)).await;
        assert_eq!(res.status(), StatusCode::Unauthorized);
        assert_eq!(
            res.headers().get("www-authenticate"),
            Some(r#"Basic realm="Restricted""#)
        );
    }

    #[tokio::test]
    async fn missing_credentials_get_401() {
        let res = run(vec![auth()], ok_handler(), request("GET / HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.status(), StatusCode::Unauthorized);
    }

    #[tokio::test]
    async fn valid_credentials_reach_handler() {
        let handler: Handler = Arc::new(|ctx| {
            Box::pin(async move {
                let user = ctx
                    .extensions()
                    .get::<BasicCredentials>()
                    .map(|c| c.username.clone())
                    .unwrap_or_default();
                Response::text(user)
            })
        });
        let res = run(vec![auth()], handler, with_auth(GOOD)).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.content(), b"admin");
    }

    #[tokio::test]
    async fn custom_validator_and_realm() {
        let mw = from_middleware(Arc::new(
            BasicAuthMiddleware::new()
                .realm("Ops")
                .validator(|c| c.username == "admin" && c.password.len() > 3),
        ));
        let res = run(vec![mw.clone()], ok_handler(), with_auth(GOOD)).await;
        assert_eq!(res.status(), StatusCode::Ok);

        let res = run(vec![mw], ok_handler(), request("GET / HTTP/1.1\r\n\r\n")).await;
        assert_eq!(res.headers().get("www-authenticate"), Some(r#"Basic realm="Ops""#));
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
