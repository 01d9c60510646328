//! Local HTTP listener for OAuth redirects and human confirmation of changes

mod pages;
pub mod routes;
pub mod server;

pub use server::{
    CallbackError, CallbackLease, CallbackServer, RedirectOutcome, ServerStatus,
    DEFAULT_IDLE_TIMEOUT,
};
