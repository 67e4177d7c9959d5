//! Identity assertion for incoming requests.
//!
//! Sessions are issued by the authentication layer (outside this crate) and
//! land in the `sessions` table; a request proves who it is by presenting
//! the token in the `session` cookie.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use crate::error::ChatError;
use crate::server::SharedState;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session";

/// Sender marker stored on messages written by staff.
pub const STAFF_SENDER: &str = "staff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Staff,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "user",
            Role::Staff => "staff",
        }
    }

    /// Parse a stored role. `admin` is accepted as staff.
    pub fn parse(s: &str) -> Self {
        match s {
            "staff" | "admin" => Role::Staff,
            _ => Role::Customer,
        }
    }
}

/// Who a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn is_staff(&self) -> bool {
        self.role == Role::Staff
    }

    /// The sender marker written on this identity's messages.
    pub fn sender(&self) -> &str {
        if self.is_staff() { STAFF_SENDER } else { &self.username }
    }
}

impl FromRequestParts<Arc<SharedState>> for Identity {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<SharedState>,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or(ChatError::Unauthenticated)?;
        let identity = state.db.lock().lookup_session(&token)?;
        identity.ok_or(ChatError::Unauthenticated)
    }
}

/// An [`Identity`] that has been checked to hold the staff role.
#[derive(Debug, Clone)]
pub struct StaffIdentity(pub Identity);

impl FromRequestParts<Arc<SharedState>> for StaffIdentity {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<SharedState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = Identity::from_request_parts(parts, state).await?;
        if !identity.is_staff() {
            tracing::warn!(user = %identity.username, "Staff endpoint refused for non-staff session");
            return Err(ChatError::Forbidden);
        }
        Ok(StaffIdentity(identity))
    }
}

/// An [`Identity`] without the staff role. Staff do not own chats.
#[derive(Debug, Clone)]
pub struct CustomerIdentity(pub Identity);

impl FromRequestParts<Arc<SharedState>> for CustomerIdentity {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<SharedState>,
    ) -> Result<Self, Self::Rejection> {
        let identity = Identity::from_request_parts(parts, state).await?;
        if identity.is_staff() {
            tracing::warn!(user = %identity.username, "Customer endpoint refused for staff session");
            return Err(ChatError::Forbidden);
        }
        Ok(CustomerIdentity(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing() {
        assert_eq!(Role::parse("admin"), Role::Staff);
        assert_eq!(Role::parse("staff"), Role::Staff);
        assert_eq!(Role::parse("user"), Role::Customer);
        assert_eq!(Role::parse(""), Role::Customer);
    }

    #[test]
    fn staff_send_as_marker() {
        let staff = Identity { username: "root".into(), role: Role::Staff };
        let customer = Identity { username: "alice".into(), role: Role::Customer };
        assert_eq!(staff.sender(), STAFF_SENDER);
        assert_eq!(customer.sender(), "alice");
    }
}
