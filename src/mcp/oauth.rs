use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::{error::AppError, utils::random_token, PKG_NAME};

const PKCE_VERIFIER_LEN: usize = 64;

/// OAuth 2.0 authorization-code client with PKCE (S256) for MCP servers.
///
/// One provider belongs to one server connection. The manager plants the
/// server id after allocation; the redirect URL is
/// `<redirect_base>/<server-id>`, which is also what gets registered in the
/// manager's callback list. The `state` parameter carries the OAuth client
/// id, matching the callback handler's expectations.
pub struct OAuthClientProvider {
    redirect_base: String,
    http: reqwest::Client,
    inner: Mutex<ProviderState>,
}

#[derive(Default)]
struct ProviderState {
    server_id: Option<String>,
    client_id: Option<String>,
    auth_url: Option<String>,
    verifier: Option<String>,
    tokens: Option<Tokens>,
    endpoints: Option<AuthEndpoints>,
}

#[derive(Clone, Debug)]
struct AuthEndpoints {
    authorization: String,
    token: String,
    registration: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct Tokens {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct ServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

impl OAuthClientProvider {
    /// `redirect_base` is the callback URL without the trailing server-id
    /// segment, e.g. `https://host/agents/my-agent/main/callback`.
    pub fn new(redirect_base: impl Into<String>) -> Self {
        Self {
            redirect_base: redirect_base.into(),
            http: reqwest::Client::new(),
            inner: Mutex::new(ProviderState::default()),
        }
    }

    pub fn set_server_id(&self, id: &str) {
        self.inner.lock().unwrap().server_id = Some(id.to_owned());
    }

    pub fn set_client_id(&self, id: &str) {
        self.inner.lock().unwrap().client_id = Some(id.to_owned());
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.lock().unwrap().client_id.clone()
    }

    /// The redirect URL for this connection; `None` until a server id is set
    pub fn redirect_url(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .server_id
            .as_ref()
            .map(|id| format!("{}/{}", self.redirect_base.trim_end_matches('/'), id))
    }

    /// The authorization URL produced by `begin_authorization`
    pub fn auth_url(&self) -> Option<String> {
        self.inner.lock().unwrap().auth_url.clone()
    }

    /// The current bearer token, if the flow has completed
    pub fn bearer(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    /// Fetch the server's authorization metadata, falling back to the
    /// conventional `/authorize` + `/token` endpoints when the well-known
    /// document is missing
    async fn endpoints(&self, server_url: &str) -> Result<AuthEndpoints, AppError> {
        if let Some(endpoints) = self.inner.lock().unwrap().endpoints.clone() {
            return Ok(endpoints);
        }
        let base = Url::parse(server_url)
            .map_err(|e| AppError::mcp(format!("invalid MCP server url {server_url:?}: {e}")))?;
        let origin = base.origin().ascii_serialization();

        let metadata_url = format!("{origin}/.well-known/oauth-authorization-server");
        let endpoints = match self.http.get(&metadata_url).send().await {
            Ok(response) if response.status().is_success() => {
                let metadata: ServerMetadata = response
                    .json()
                    .await
                    .map_err(|e| AppError::mcp(format!("invalid authorization metadata: {e}")))?;
                AuthEndpoints {
                    authorization: metadata.authorization_endpoint,
                    token: metadata.token_endpoint,
                    registration: metadata.registration_endpoint,
                }
            }
            _ => {
                debug!(server = server_url, "no authorization metadata; using conventional endpoints");
                AuthEndpoints {
                    authorization: format!("{origin}/authorize"),
                    token: format!("{origin}/token"),
                    registration: Some(format!("{origin}/register")),
                }
            }
        };
        self.inner.lock().unwrap().endpoints = Some(endpoints.clone());
        Ok(endpoints)
    }

    /// Start the authorization-code flow: ensure a client registration,
    /// generate the PKCE pair, and build the authorization URL the user must
    /// visit. Returns that URL.
    pub async fn begin_authorization(&self, server_url: &str) -> Result<String, AppError> {
        let endpoints = self.endpoints(server_url).await?;
        let redirect_url = self
            .redirect_url()
            .ok_or_else(|| AppError::mcp("auth provider has no server id"))?;

        let client_id = match self.client_id() {
            Some(id) => id,
            None => {
                let registration = endpoints.registration.as_ref().ok_or_else(|| {
                    AppError::mcp("server offers no client registration endpoint")
                })?;
                let response = self
                    .http
                    .post(registration)
                    .json(&json!({
                        "client_name": PKG_NAME,
                        "redirect_uris": [redirect_url],
                        "grant_types": ["authorization_code"],
                        "response_types": ["code"],
                        "token_endpoint_auth_method": "none",
                    }))
                    .send()
                    .await
                    .map_err(|e| AppError::mcp(format!("client registration failed: {e}")))?;
                if !response.status().is_success() {
                    return Err(AppError::mcp(format!(
                        "client registration failed with status {}",
                        response.status()
                    )));
                }
                let registered: RegistrationResponse = response
                    .json()
                    .await
                    .map_err(|e| AppError::mcp(format!("invalid registration response: {e}")))?;
                self.set_client_id(&registered.client_id);
                registered.client_id
            }
        };

        let verifier = random_token(PKCE_VERIFIER_LEN);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

        let mut auth_url = Url::parse(&endpoints.authorization)
            .map_err(|e| AppError::mcp(format!("invalid authorization endpoint: {e}")))?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", &redirect_url)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            // The state parameter carries the client id; the callback
            // handler plants it back into the provider
            .append_pair("state", &client_id);
        let auth_url = auth_url.to_string();

        let mut inner = self.inner.lock().unwrap();
        inner.verifier = Some(verifier);
        inner.auth_url = Some(auth_url.clone());
        Ok(auth_url)
    }

    /// Exchange the authorization code for tokens
    pub async fn finish_authorization(
        &self,
        server_url: &str,
        code: &str,
    ) -> Result<(), AppError> {
        let endpoints = self.endpoints(server_url).await?;
        let redirect_url = self
            .redirect_url()
            .ok_or_else(|| AppError::mcp("auth provider has no server id"))?;
        let client_id = self
            .client_id()
            .ok_or_else(|| AppError::mcp("auth provider has no client id"))?;
        let verifier = self.inner.lock().unwrap().verifier.clone();

        let mut form = vec![
            ("grant_type", "authorization_code".to_owned()),
            ("code", code.to_owned()),
            ("redirect_uri", redirect_url),
            ("client_id", client_id),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(&endpoints.token)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::mcp(format!("token exchange failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::mcp(format!(
                "token exchange failed with status {}",
                response.status()
            )));
        }
        let tokens: Tokens = response
            .json()
            .await
            .map_err(|e| AppError::mcp(format!("invalid token response: {e}")))?;
        self.inner.lock().unwrap().tokens = Some(tokens);
        Ok(())
    }
}

impl std::fmt::Debug for OAuthClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientProvider")
            .field("redirect_base", &self.redirect_base)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_url_appends_the_server_id() {
        let provider = OAuthClientProvider::new("https://host/agents/a/x/callback/");
        assert_eq!(provider.redirect_url(), None);
        provider.set_server_id("s1AbCdEf");
        assert_eq!(
            provider.redirect_url().unwrap(),
            "https://host/agents/a/x/callback/s1AbCdEf"
        );
    }

    #[test]
    fn client_id_survives_replanting() {
        let provider = OAuthClientProvider::new("https://host/cb");
        assert_eq!(provider.client_id(), None);
        provider.set_client_id("client-1");
        provider.set_client_id("client-2");
        assert_eq!(provider.client_id(), Some("client-2".into()));
    }
}
