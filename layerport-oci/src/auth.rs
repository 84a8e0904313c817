//! Registry token handshake.
//!
//! The registry is probed once with an unauthenticated `GET /v2/`.  A `401`
//! carries a `WWW-Authenticate: Bearer realm=…,service=…,scope=…` challenge
//! which is exchanged at `realm` for a bearer token.  The token is obtained
//! once per export and shared read-only by every blob download; it is never
//! refreshed.

use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::{OciError, Result};

/// Bearer token issued for one repository scope.  An anonymous token (no
/// secret) means the registry never challenged us.
#[derive(Debug)]
pub struct BearerToken {
    secret: Option<SecretString>,
    scope: String,
}

impl BearerToken {
    pub fn new(token: String, scope: String) -> Self {
        Self {
            secret: Some(SecretString::from(token)),
            scope,
        }
    }

    pub fn anonymous(scope: String) -> Self {
        Self {
            secret: None,
            scope,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.secret.is_none()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Attach `Authorization: Bearer …` to `req` unless anonymous.
    pub fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => req.bearer_auth(secret.expose_secret()),
            None => req,
        }
    }
}

/// Basic credentials presented to the token service.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// A parsed `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(OciError::Auth(format!(
                "unsupported authentication scheme '{}'",
                scheme
            )));
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in parse_params(params) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        let realm = realm
            .filter(|r| !r.is_empty())
            .ok_or_else(|| OciError::Auth("www-authenticate header missing realm".to_string()))?;

        Ok(Self {
            realm,
            service,
            scope,
        })
    }
}

/// Split `key="value",key2=value2` pairs, honouring commas inside quotes.
fn parse_params(mut rest: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    rest = &quoted[end + 1..];
                    quoted[..end].to_string()
                }
                None => {
                    rest = "";
                    quoted.to_string()
                }
            }
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        out.push((key, value));
    }
    out
}

/// Obtains the pull token for one repository.
pub struct BlobAuthenticator<'a> {
    client: &'a reqwest::Client,
    credentials: Option<&'a Credentials>,
}

impl<'a> BlobAuthenticator<'a> {
    pub fn new(client: &'a reqwest::Client) -> Self {
        Self {
            client,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<&'a Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Probe `{base_url}/v2/` and, if challenged, fetch a token for
    /// `repository`.  Any non-success status other than the challenge is
    /// fatal.
    pub async fn authenticate(&self, base_url: &str, repository: &str) -> Result<BearerToken> {
        let default_scope = format!("repository:{}:pull", repository);
        let probe_url = format!("{}/v2/", base_url.trim_end_matches('/'));

        let resp = self.client.get(&probe_url).send().await?;
        let status = resp.status();

        if status.is_success() {
            debug!(%probe_url, "registry did not challenge, continuing anonymously");
            return Ok(BearerToken::anonymous(default_scope));
        }
        if status != StatusCode::UNAUTHORIZED {
            return Err(OciError::Auth(format!(
                "registry probe {} returned {}",
                probe_url, status
            )));
        }

        let header = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                OciError::Auth("401 response without www-authenticate header".to_string())
            })?
            .to_string();

        let challenge = Challenge::parse(&header)?;
        let scope = challenge.scope.clone().unwrap_or(default_scope);
        self.fetch_token(&challenge, scope).await
    }

    async fn fetch_token(&self, challenge: &Challenge, scope: String) -> Result<BearerToken> {
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        query.push(("scope", scope.as_str()));

        debug!(realm = %challenge.realm, %scope, "requesting bearer token");
        let mut req = self.client.get(&challenge.realm).query(&query);
        if let Some(creds) = self.credentials {
            req = req.basic_auth(&creds.username, Some(creds.password.expose_secret()));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| OciError::Auth(format!("token response is not JSON: {}", e)))?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OciError::Auth("token response missing token field".to_string()))?;

        info!(%scope, "obtained registry token");
        Ok(BearerToken::new(token.to_string(), scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn challenge_parses_docker_hub_header() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#;
        let c = Challenge::parse(header).unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/alpine:pull"));
    }

    #[test]
    fn challenge_keeps_commas_inside_quotes() {
        let header = r#"bearer realm="https://r/token", scope="repository:a/b:pull,push""#;
        let c = Challenge::parse(header).unwrap();
        assert_eq!(c.scope.as_deref(), Some("repository:a/b:pull,push"));
        assert_eq!(c.service, None);
    }

    #[test]
    fn challenge_rejects_basic_and_missing_realm() {
        assert!(Challenge::parse(r#"Basic realm="registry""#).is_err());
        assert!(Challenge::parse(r#"Bearer service="x""#).is_err());
    }

    #[tokio::test]
    async fn no_challenge_yields_anonymous_token() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(200).body("{}");
            })
            .await;

        let client = reqwest::Client::new();
        let token = BlobAuthenticator::new(&client)
            .authenticate(&server.base_url(), "library/redis")
            .await
            .unwrap();

        probe.assert_async().await;
        assert!(token.is_anonymous());
        assert_eq!(token.scope(), "repository:library/redis:pull");
    }

    #[tokio::test]
    async fn challenge_is_exchanged_for_token_with_default_scope() {
        let server = MockServer::start_async().await;
        let realm = server.url("/token");
        let challenge = format!(r#"Bearer realm="{}",service="test-registry""#, realm);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;
        let token_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/token")
                    .query_param("service", "test-registry")
                    .query_param("scope", "repository:team/app:pull");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"token":"s3cr3t"}"#);
            })
            .await;

        let client = reqwest::Client::new();
        let token = BlobAuthenticator::new(&client)
            .authenticate(&server.base_url(), "team/app")
            .await
            .unwrap();

        token_mock.assert_async().await;
        assert!(!token.is_anonymous());
        assert_eq!(token.scope(), "repository:team/app:pull");
    }

    #[tokio::test]
    async fn probe_failure_is_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(503);
            })
            .await;

        let client = reqwest::Client::new();
        let err = BlobAuthenticator::new(&client)
            .authenticate(&server.base_url(), "team/app")
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Auth(_)));
    }

    #[tokio::test]
    async fn token_endpoint_failure_is_fatal() {
        let server = MockServer::start_async().await;
        let challenge = format!(r#"Bearer realm="{}""#, server.url("/token"));
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(403).body("denied");
            })
            .await;

        let client = reqwest::Client::new();
        let err = BlobAuthenticator::new(&client)
            .authenticate(&server.base_url(), "team/app")
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::Auth(_)));
    }
}
