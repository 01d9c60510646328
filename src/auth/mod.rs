pub mod broker;
pub mod oauth;
pub mod provider;
pub mod single_flight;
pub mod token_store;
pub mod types;

pub use broker::{BrokerAuth, DEFAULT_BROKER_BASE};
pub use oauth::{DirectOAuth, DirectOAuthConfig, FlowOutcome, FlowPhase};
pub use provider::AuthProvider;
pub use single_flight::RefreshGate;
pub use token_store::TokenStore;
pub use types::{AuthError, Token, TokenSource};
