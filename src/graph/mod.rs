pub mod client;
pub mod error;
pub mod params;

pub use client::{GraphClient, LoginLink, ResolvedToken, RetryPolicy, TokenOrigin};
pub use error::{ApiError, ErrorKind, ErrorReport, RecoveryAction};
pub use params::{canonicalize, Params};
