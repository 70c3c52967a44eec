//! Second-factor and passkey verification over HTTP.
//!
//! Both clients authenticate with the bearer token of the session under
//! verification, so the server can refuse checks for sessions it no longer
//! honors.
//!
//! Status triage: 401 and 403 surface as `CredentialRejected` (the server
//! made a decision), everything else that is not a success surfaces as
//! `BackendUnavailable` (retryable from the caller's point of view).

use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::{
    ActionLink, PasskeyAssertion, PasskeyBackend, PasskeyRegistration, SecondFactorBackend,
    SecondFactorOutcome, Session,
};
use crate::APP_USER_AGENT;

fn build_client() -> Result<Client, AuthError> {
    Client::builder()
        .user_agent(APP_USER_AGENT)
        .build()
        .map_err(|err| AuthError::BackendUnavailable(err.into()))
}

/// Pull a human-readable message out of an error body, tolerating both
/// `{"errors": [..]}` and `{"error": ".."}` shapes.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(errors) = value.get("errors").and_then(Value::as_array) {
            let joined = errors
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if !joined.is_empty() {
                return joined;
            }
        }
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    body.trim().to_string()
}

async fn triage(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AuthError::CredentialRejected);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::BackendUnavailable(anyhow!(
        "verification backend returned {status}: {}",
        error_message(&body)
    )))
}

/// Second-factor verification against an HTTP backend.
#[derive(Clone)]
pub struct HttpSecondFactorBackend {
    client: Client,
    base_url: Url,
}

impl HttpSecondFactorBackend {
    /// # Errors
    /// `BackendUnavailable` when the HTTP client cannot be built.
    pub fn new(base_url: Url) -> Result<Self, AuthError> {
        Ok(Self {
            client: build_client()?,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|err| AuthError::BackendUnavailable(err.into()))
    }

    async fn post_code(
        &self,
        path: &str,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&session.token)
            .json(&json!({ "code": code }))
            .send()
            .await
            .map_err(|err| AuthError::BackendUnavailable(err.into()))?;
        let response = triage(response).await?;
        let outcome: SecondFactorOutcome = response
            .json()
            .await
            .map_err(|err| AuthError::BackendUnavailable(err.into()))?;
        debug!(verified = outcome.verified, "second-factor check returned");
        Ok(outcome)
    }
}

#[async_trait]
impl SecondFactorBackend for HttpSecondFactorBackend {
    async fn verify_totp(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError> {
        self.post_code("second-factor/totp/verify", session, code)
            .await
    }

    async fn verify_backup_code(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<SecondFactorOutcome, AuthError> {
        self.post_code("second-factor/backup-codes/verify", session, code)
            .await
    }
}

/// Passkey credential persistence and assertion verification over HTTP.
#[derive(Clone)]
pub struct HttpPasskeyBackend {
    client: Client,
    base_url: Url,
}

impl HttpPasskeyBackend {
    /// # Errors
    /// `BackendUnavailable` when the HTTP client cannot be built.
    pub fn new(base_url: Url) -> Result<Self, AuthError> {
        Ok(Self {
            client: build_client()?,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|err| AuthError::BackendUnavailable(err.into()))
    }
}

#[async_trait]
impl PasskeyBackend for HttpPasskeyBackend {
    async fn register(
        &self,
        user_id: Uuid,
        credential: &PasskeyRegistration,
    ) -> Result<(), AuthError> {
        let url = self.endpoint("passkeys/register")?;
        let response = self
            .client
            .post(url)
            .json(&json!({
                "user_id": user_id,
                "credential_id": credential.credential_id,
                "public_key": BASE64_STANDARD.encode(&credential.public_key),
            }))
            .send()
            .await
            .map_err(|err| AuthError::BackendUnavailable(err.into()))?;
        triage(response).await?;
        debug!(user_id = %user_id, "passkey credential persisted");
        Ok(())
    }

    async fn authenticate(&self, assertion: &PasskeyAssertion) -> Result<ActionLink, AuthError> {
        let url = self.endpoint("passkeys/authenticate")?;
        let response = self
            .client
            .post(url)
            .json(&json!({
                "credential_id": assertion.credential_id,
                "signature": BASE64_STANDARD.encode(&assertion.signature),
                "authenticator_data": BASE64_STANDARD.encode(&assertion.authenticator_data),
                "client_data": BASE64_STANDARD.encode(&assertion.client_data),
            }))
            .send()
            .await
            .map_err(|err| AuthError::BackendUnavailable(err.into()))?;
        // No credential on record for this assertion.
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AuthError::AuthenticatorAbsent);
        }
        let response = triage(response).await?;
        response
            .json()
            .await
            .map_err(|err| AuthError::BackendUnavailable(err.into()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{HttpPasskeyBackend, HttpSecondFactorBackend};
    use crate::error::AuthError;
    use crate::store::{PasskeyAssertion, PasskeyBackend, SecondFactorBackend, Session};
    use anyhow::Result;
    use serde_json::json;
    use std::net::TcpListener;
    use url::Url;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn session() -> Session {
        Session {
            token: "session-token".to_string(),
            user_id: Uuid::new_v4(),
            issued_at_unix: 1_000,
            expires_at_unix: 2_000,
        }
    }

    #[tokio::test]
    async fn totp_verify_sends_bearer_token_and_parses_outcome() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/second-factor/totp/verify"))
            .and(header("authorization", "Bearer session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "verified": true,
                "remaining_backup_codes": null
            })))
            .mount(&server)
            .await;

        let backend = HttpSecondFactorBackend::new(Url::parse(&server.uri())?)?;
        let outcome = backend.verify_totp(&session(), "123456").await?;
        assert!(outcome.verified);
        assert!(outcome.remaining_backup_codes.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn backup_code_verify_reports_remaining_codes() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/second-factor/backup-codes/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "verified": true,
                "remaining_backup_codes": 7
            })))
            .mount(&server)
            .await;

        let backend = HttpSecondFactorBackend::new(Url::parse(&server.uri())?)?;
        let outcome = backend
            .verify_backup_code(&session(), "ABCD-EFGH-JKLM")
            .await?;
        assert_eq!(outcome.remaining_backup_codes, Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn revoked_session_is_rejected_not_unavailable() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/second-factor/totp/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "errors": ["session not honored"]
            })))
            .mount(&server)
            .await;

        let backend = HttpSecondFactorBackend::new(Url::parse(&server.uri())?)?;
        let err = backend.verify_totp(&session(), "123456").await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialRejected));
        Ok(())
    }

    #[tokio::test]
    async fn server_errors_surface_with_the_backend_message() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/second-factor/totp/verify"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "errors": ["maintenance window"]
            })))
            .mount(&server)
            .await;

        let backend = HttpSecondFactorBackend::new(Url::parse(&server.uri())?)?;
        let err = backend.verify_totp(&session(), "123456").await.unwrap_err();
        let AuthError::BackendUnavailable(source) = err else {
            panic!("expected BackendUnavailable, got {err:?}");
        };
        assert!(source.to_string().contains("maintenance window"));
        Ok(())
    }

    #[tokio::test]
    async fn passkey_register_posts_the_credential() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/passkeys/register"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpPasskeyBackend::new(Url::parse(&server.uri())?)?;
        backend
            .register(
                Uuid::new_v4(),
                &crate::store::PasskeyRegistration {
                    credential_id: "cred-1".to_string(),
                    public_key: vec![1, 2, 3],
                },
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_credential_is_absent_not_rejected() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/passkeys/authenticate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = HttpPasskeyBackend::new(Url::parse(&server.uri())?)?;
        let assertion = PasskeyAssertion {
            credential_id: "missing".to_string(),
            signature: vec![0; 64],
            authenticator_data: vec![1],
            client_data: vec![2],
        };
        let err = backend.authenticate(&assertion).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticatorAbsent));
        Ok(())
    }

    #[tokio::test]
    async fn accepted_assertion_yields_the_action_link() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/passkeys/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "https://auth.example.com/complete/abc123"
            })))
            .mount(&server)
            .await;

        let backend = HttpPasskeyBackend::new(Url::parse(&server.uri())?)?;
        let assertion = PasskeyAssertion {
            credential_id: "cred-1".to_string(),
            signature: vec![0; 64],
            authenticator_data: vec![1],
            client_data: vec![2],
        };
        let link = backend.authenticate(&assertion).await?;
        assert_eq!(link.url, "https://auth.example.com/complete/abc123");
        Ok(())
    }
}
