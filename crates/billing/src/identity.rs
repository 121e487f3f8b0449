//! Team and user directory
//!
//! Used only to expand an organization attribution into the human accounts
//! responsible for it, and to block accounts after a payment dispute.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Member,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub user_id: String,
    pub role: TeamRole,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity resource not found: {0}")]
    NotFound(String),

    #[error("identity service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("identity service request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for IdentityError {
    fn from(e: reqwest::Error) -> Self {
        IdentityError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn get_team_members(&self, team_id: &str) -> Result<Vec<TeamMember>, IdentityError>;

    async fn block_user(&self, user_id: &str, reason: &str) -> Result<(), IdentityError>;
}

/// Identity service connection settings
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub base_url: String,
    pub token: String,
}

impl IdentityConfig {
    pub fn from_env() -> BillingResult<Self> {
        let base_url = std::env::var("IDENTITY_SERVICE_URL")
            .map_err(|_| BillingError::Config("IDENTITY_SERVICE_URL not set".to_string()))?;
        let token = std::env::var("IDENTITY_SERVICE_TOKEN")
            .map_err(|_| BillingError::Config("IDENTITY_SERVICE_TOKEN not set".to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

/// [`IdentityGateway`] over the identity service's HTTP API
#[derive(Clone)]
pub struct HttpIdentityGateway {
    client: reqwest::Client,
    config: IdentityConfig,
}

#[derive(Deserialize)]
struct TeamMembersResponse {
    members: Vec<TeamMember>,
}

#[derive(Serialize)]
struct BlockUserRequest<'a> {
    blocked: bool,
    reason: &'a str,
}

impl HttpIdentityGateway {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn check(
        response: reqwest::Response,
        resource: &str,
    ) -> Result<reqwest::Response, IdentityError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IdentityError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl IdentityGateway for HttpIdentityGateway {
    async fn get_team_members(&self, team_id: &str) -> Result<Vec<TeamMember>, IdentityError> {
        let response = self
            .client
            .get(format!("{}/v1/teams/{}/members", self.config.base_url, team_id))
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        let response = Self::check(response, &format!("team {}", team_id)).await?;
        let body: TeamMembersResponse = response.json().await?;

        tracing::debug!(team_id = %team_id, members = body.members.len(), "Fetched team members");

        Ok(body.members)
    }

    async fn block_user(&self, user_id: &str, reason: &str) -> Result<(), IdentityError> {
        let response = self
            .client
            .post(format!("{}/v1/users/{}/block", self.config.base_url, user_id))
            .bearer_auth(&self.config.token)
            .json(&BlockUserRequest {
                blocked: true,
                reason,
            })
            .send()
            .await?;

        Self::check(response, &format!("user {}", user_id)).await?;

        tracing::info!(user_id = %user_id, reason = %reason, "Blocked user");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn gateway(server: &mockito::ServerGuard) -> HttpIdentityGateway {
        HttpIdentityGateway::new(IdentityConfig {
            base_url: server.url(),
            token: "test-token".to_string(),
        })
    }

    #[tokio::test]
    async fn test_get_team_members() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/teams/7/members")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"members":[
                    {"userId":"u1","role":"owner"},
                    {"userId":"u2","role":"member"},
                    {"userId":"u4","role":"billing_admin"}
                ]}"#,
            )
            .create_async()
            .await;

        let members = gateway(&server).get_team_members("7").await.unwrap();

        mock.assert_async().await;
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].role, TeamRole::Owner);
        assert_eq!(members[1].role, TeamRole::Member);
        assert_eq!(members[2].role, TeamRole::Unknown);
    }

    #[tokio::test]
    async fn test_get_team_members_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/teams/missing/members")
            .with_status(404)
            .create_async()
            .await;

        let err = gateway(&server).get_team_members("missing").await.unwrap_err();
        assert!(matches!(err, IdentityError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_block_user_sends_reason() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/users/u1/block")
            .match_body(Matcher::Json(serde_json::json!({
                "blocked": true,
                "reason": "User has created a Stripe dispute ID: dp_1"
            })))
            .with_status(204)
            .create_async()
            .await;

        gateway(&server)
            .block_user("u1", "User has created a Stripe dispute ID: dp_1")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_block_user_server_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/users/u2/block")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = gateway(&server).block_user("u2", "reason").await.unwrap_err();
        assert!(matches!(err, IdentityError::Status { status: 500, .. }));
    }
}
