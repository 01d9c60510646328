use super::broker::BrokerAuth;
use super::oauth::DirectOAuth;
use super::types::{AuthError, Token};

/// The configured way of obtaining platform tokens, chosen once at startup
pub enum AuthProvider {
    Broker(BrokerAuth),
    Direct(DirectOAuth),
}

impl AuthProvider {
    pub async fn get_access_token(&self) -> Result<Token, AuthError> {
        match self {
            AuthProvider::Broker(broker) => broker.get_access_token().await,
            AuthProvider::Direct(direct) => direct.get_access_token().await,
        }
    }

    /// Forget the current token so the next call obtains a fresh one
    pub async fn clear_cached_token(&self) {
        match self {
            AuthProvider::Broker(broker) => broker.clear_cached_token().await,
            AuthProvider::Direct(direct) => direct.clear_cached_token().await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthProvider::Broker(_) => "broker",
            AuthProvider::Direct(_) => "direct",
        }
    }

    pub fn as_direct(&self) -> Option<&DirectOAuth> {
        match self {
            AuthProvider::Direct(direct) => Some(direct),
            AuthProvider::Broker(_) => None,
        }
    }
}
