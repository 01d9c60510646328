use super::result::ToolResult;
use crate::confirm::ChangeSet;
use crate::graph::{GraphClient, LoginLink, Params};
use reqwest::Method;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GraphGetParams {
    /// Path under the Graph API root, e.g. `act_123/campaigns` or `me/adaccounts`
    pub endpoint: String,
    /// Query parameters; objects and arrays are sent as JSON text
    #[serde(default)]
    pub params: Option<Params>,
    /// Use this token instead of the cached one
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProposeUpdateParams {
    /// Id of the campaign, ad set or ad to change
    pub object_id: String,
    /// Field name to new value, e.g. `{"status": "PAUSED", "daily_budget": 5000}`
    pub changes: ChangeSet,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ChangeIdParams {
    /// Id returned by `propose_update`
    pub change_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ApplyUpdateParams {
    /// Id returned by `propose_update`
    pub change_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// MCP server exposing the Graph gateway to an agent
#[derive(Clone)]
pub struct MetaAdsMcpServer {
    client: Arc<GraphClient>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MetaAdsMcpServer {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self {
            client,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Get a link to log in to Meta Ads. Starts the login in the background; open the link in a browser to finish it.")]
    async fn get_login_link(&self) -> Result<CallToolResult, McpError> {
        Ok(respond(self.login_link().await))
    }

    #[tool(description = "Read from the Meta Graph API (GET). Returns {success: body} or {error, details, params_sent}.")]
    async fn graph_get(
        &self,
        Parameters(params): Parameters<GraphGetParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.read(params).await))
    }

    #[tool(description = "Propose a change to a campaign, ad set or ad. Returns a confirmation link the user must open and approve before the change can be applied.")]
    async fn propose_update(
        &self,
        Parameters(params): Parameters<ProposeUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.propose(params).await))
    }

    #[tool(description = "Check whether a proposed change has been approved.")]
    async fn confirmation_status(
        &self,
        Parameters(params): Parameters<ChangeIdParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.status(params).await))
    }

    #[tool(description = "Apply a proposed change after the user approved it. Each approval applies once.")]
    async fn apply_confirmed_update(
        &self,
        Parameters(params): Parameters<ApplyUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.apply(params).await))
    }

    #[tool(description = "Forget the cached Meta Ads token.")]
    async fn logout(&self) -> Result<CallToolResult, McpError> {
        let result = match self.client.logout().await {
            Ok(()) => ToolResult::success(json!({"message": "Logged out"})),
            Err(e) => ToolResult::from_error(&e, &Params::new()),
        };
        Ok(respond(result))
    }
}

impl MetaAdsMcpServer {
    async fn login_link(&self) -> ToolResult {
        match self.client.begin_login().await {
            Ok(LoginLink::Url(url)) => ToolResult::success(json!({
                "status": "awaiting_login",
                "login_url": url.as_str(),
                "markdown_link": format!("[Log in to Meta Ads]({})", url),
                "message": "Open the link and approve access, then retry your request.",
            })),
            Ok(LoginLink::AlreadyAuthenticated) => ToolResult::success(json!({
                "status": "authenticated",
                "message": "A valid token is already available.",
            })),
            Ok(LoginLink::Broker) => ToolResult::success(json!({
                "status": "broker",
                "message": "Tokens are issued by the configured broker; no browser login is needed.",
            })),
            Err(e) => ToolResult::from_error(&e, &Params::new()),
        }
    }

    async fn read(&self, params: GraphGetParams) -> ToolResult {
        let query = params.params.unwrap_or_default();
        self.client
            .call(
                &params.endpoint,
                params.access_token.as_deref(),
                &query,
                Method::GET,
            )
            .await
    }

    async fn propose(&self, params: ProposeUpdateParams) -> ToolResult {
        match self
            .client
            .confirm_mutation(&params.object_id, params.changes.clone())
            .await
        {
            Ok(armed) => ToolResult::success(json!({
                "change_id": armed.id,
                "confirmation_url": armed.url.as_str(),
                "markdown_link": format!("[Review and approve the change]({})", armed.url),
                "expires_at": armed.expires_at,
                "message": "Nothing has changed yet. Ask the user to open the link and approve, then call apply_confirmed_update.",
            })),
            Err(e) => ToolResult::from_error(&e, &params.changes),
        }
    }

    async fn status(&self, params: ChangeIdParams) -> ToolResult {
        let status = self.client.confirmation_status(&params.change_id).await;
        ToolResult::success(json!({
            "change_id": params.change_id,
            "confirmation": status,
        }))
    }

    async fn apply(&self, params: ApplyUpdateParams) -> ToolResult {
        self.client
            .call_confirmed(&params.change_id, params.access_token.as_deref())
            .await
    }
}

fn respond(result: ToolResult) -> CallToolResult {
    let content = vec![Content::text(result.to_json_string())];
    if result.is_success() {
        CallToolResult::success(content)
    } else {
        CallToolResult::error(content)
    }
}

#[tool_handler]
impl ServerHandler for MetaAdsMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Meta Ads tools. Reads go through graph_get. Changes are never applied directly: \
                 propose_update returns a link the user must approve, then apply_confirmed_update \
                 applies it once. On an AuthRequired error, call get_login_link."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
