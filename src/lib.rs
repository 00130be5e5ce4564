#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "federated")]
pub mod pkce;
pub mod session;
pub mod store;
pub mod token;
pub mod types;

// Re-exports for convenient access
pub use client::{ApiClient, RequestDescriptor};
pub use config::{AuthEndpoints, ClientConfig};
pub use error::{Error, StoreError};
pub use reqwest::Method;
pub use session::{AuthState, SessionManager, SessionSnapshot};
#[cfg(feature = "federated")]
pub use pkce::Pkce;
#[cfg(feature = "federated")]
pub use session::{FederatedCallback, FederatedRedirect};
pub use store::{FileTokenStore, MemoryTokenStore, NoopTokenStore, TokenStore};
pub use types::{Credentials, Registration, Session, SessionToken, User, UserId, UserRole};
