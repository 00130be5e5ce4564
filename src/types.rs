use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Backend user identifier (opaque string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Opaque bearer credential issued by the backend.
///
/// `Debug` output is redacted so tokens do not leak into logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum UserRole {
    #[display("customer")]
    Customer,
    #[display("service_provider")]
    ServiceProvider,
}

/// The authenticated principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Set for service providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub created_at: Option<time::OffsetDateTime>,
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: UserId(id.into()),
            email: email.into(),
            name: String::new(),
            role,
            phone: None,
            business_name: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    #[must_use]
    pub fn with_business_name(mut self, business_name: impl Into<String>) -> Self {
        self.business_name = Some(business_name.into());
        self
    }

    #[must_use]
    pub fn is_service_provider(&self) -> bool {
        self.role == UserRole::ServiceProvider
    }
}

/// Body of `POST /auth/login`.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub identifier: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(identifier: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("password", &"***")
            .finish()
    }
}

/// Body of `POST /auth/register`.
#[derive(Clone, Serialize)]
#[non_exhaustive]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
}

impl Registration {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        role: UserRole,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            password: password.into(),
            role,
            phone: None,
            business_name: None,
        }
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    #[must_use]
    pub fn with_business_name(mut self, business_name: impl Into<String>) -> Self {
        self.business_name = Some(business_name.into());
        self
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Token + user pair. Replaced as a whole, never field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    token: SessionToken,
    user: User,
}

impl Session {
    #[must_use]
    pub fn new(token: SessionToken, user: User) -> Self {
        Self { token, user }
    }

    #[must_use]
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }
}

/// Response of the login, register and federated callback endpoints.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthResponse {
    #[serde(default)]
    pub(crate) token: Option<String>,
    #[serde(default)]
    pub(crate) user: Option<User>,
}

impl AuthResponse {
    /// Both fields are required; a partial response is a request failure.
    pub(crate) fn into_session(self, status: u16) -> Result<Session, Error> {
        let token = self
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| missing_field(status, "token"))?;
        let user = self.user.ok_or_else(|| missing_field(status, "user"))?;
        Ok(Session::new(SessionToken(token), user))
    }
}

fn missing_field(status: u16, field: &str) -> Error {
    Error::Request {
        status,
        message: format!("Authentication response is missing `{field}`"),
    }
}

/// `GET /auth/me` answers with either the user or `{ "user": ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ProfileResponse {
    Wrapped { user: User },
    Bare(User),
}

impl From<ProfileResponse> for User {
    fn from(r: ProfileResponse) -> Self {
        match r {
            ProfileResponse::Wrapped { user } | ProfileResponse::Bare(user) => user,
        }
    }
}
