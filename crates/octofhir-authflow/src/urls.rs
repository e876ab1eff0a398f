//! Public URLs of the flow endpoints.

use url::Url;

use crate::AuthResult;
use crate::error::AuthError;

/// Builds absolute URLs below the public base URL.
#[derive(Debug, Clone)]
pub struct Urls {
    base: Url,
}

impl Urls {
    /// Creates the builder. A trailing slash is added to the base path so
    /// relative joins append instead of replacing the last segment.
    #[must_use]
    pub fn new(public_url: &Url) -> Self {
        let mut base = public_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        base.set_fragment(None);
        Self { base }
    }

    fn build(&self, path: &str, query: &[(&str, &str)]) -> AuthResult<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| AuthError::internal(format!("failed to build URL {path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Link carrying an action token, as sent by e-mail.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn action_token(&self, token: &str, client_id: Option<&str>) -> AuthResult<Url> {
        let mut query = vec![("key", token)];
        if let Some(client_id) = client_id {
            query.push(("client_id", client_id));
        }
        self.build("login-actions/action-token", &query)
    }

    /// Entry of the first broker login flow.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn first_broker_login(&self, code: &str, client_id: &str) -> AuthResult<Url> {
        self.build(
            "login-actions/first-broker-login",
            &[("code", code), ("client_id", client_id)],
        )
    }

    /// Entry of the post broker login flow.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn post_broker_login(&self, code: &str, client_id: &str) -> AuthResult<Url> {
        self.build(
            "login-actions/post-broker-login",
            &[("code", code), ("client_id", client_id)],
        )
    }

    /// Restart of the browser login.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn restart(&self, client_id: &str) -> AuthResult<Url> {
        self.build("login-actions/restart", &[("client_id", client_id)])
    }

    /// Broker login initiation for `alias`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn broker_login(&self, alias: &str, code: &str, client_id: &str) -> AuthResult<Url> {
        self.build(
            &format!("broker/{alias}/login"),
            &[("code", code), ("client_id", client_id)],
        )
    }

    /// Callback endpoint registered at the external provider.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn broker_endpoint(&self, alias: &str) -> AuthResult<Url> {
        self.build(&format!("broker/{alias}/endpoint"), &[])
    }

    /// Continuation after the first broker login flow.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn after_first_broker_login(&self, code: &str, client_id: &str) -> AuthResult<Url> {
        self.build(
            "broker/after-first-broker-login",
            &[("code", code), ("client_id", client_id)],
        )
    }

    /// Continuation after the post broker login flow.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn after_post_broker_login(&self, code: &str, client_id: &str) -> AuthResult<Url> {
        self.build(
            "broker/after-post-broker-login",
            &[("code", code), ("client_id", client_id)],
        )
    }

    /// Default account console page.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the URL cannot be built.
    pub fn account_console(&self) -> AuthResult<Url> {
        self.build("account", &[])
    }
}

/// Appends query parameters to `url`.
#[must_use]
pub fn with_query(mut url: Url, params: &[(&str, &str)]) -> Url {
    url.query_pairs_mut().extend_pairs(params);
    url
}
