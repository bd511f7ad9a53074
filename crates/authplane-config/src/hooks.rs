//! Callback and handle types carried by the configuration.
//!
//! None of these survive serialization. The manager copies them across every
//! reload with [`crate::model::preserve_runtime_fields`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Reference-counted handle compared by identity.
pub struct Shared<T: ?Sized>(Arc<T>);

impl<T: ?Sized> Shared<T> {
    /// Wrap an existing `Arc`.
    #[must_use]
    pub const fn from_arc(inner: Arc<T>) -> Self {
        Self(inner)
    }

    /// Borrow the underlying `Arc`.
    #[must_use]
    pub const fn as_arc(&self) -> &Arc<T> {
        &self.0
    }

    /// Whether both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Shared<T> {
    /// Allocate a new handle.
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self(Arc::new(inner))
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> fmt::Debug for Shared<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Shared(..)")
    }
}

impl<T: ?Sized> From<Arc<T>> for Shared<T> {
    fn from(inner: Arc<T>) -> Self {
        Self(inner)
    }
}

/// Pair two optional handles by identity.
#[must_use]
pub fn same_handle<T: ?Sized>(left: Option<&Shared<T>>, right: Option<&Shared<T>>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => left.ptr_eq(right),
        (None, None) => true,
        _ => false,
    }
}

/// User projection handed to hooks and published on auth events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    /// Stable user identifier.
    pub id: String,
    /// Primary email address.
    pub email: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether the email has been verified.
    #[serde(default)]
    pub email_verified: bool,
}

/// `(user, url, token)` mail callback.
pub type SendEmailFn = dyn Fn(&AuthUser, &str, &str) -> anyhow::Result<()> + Send + Sync;
/// `(user, new_email, url, token)` mail callback.
pub type SendEmailChangeFn =
    dyn Fn(&AuthUser, &str, &str, &str) -> anyhow::Result<()> + Send + Sync;
/// Password hashing callback.
pub type HashPasswordFn = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;
/// `(hash, candidate)` password verification callback.
pub type VerifyPasswordFn = dyn Fn(&str, &str) -> bool + Send + Sync;
/// Callback invoked with a user after an auth lifecycle event.
pub type UserHookFn = dyn Fn(&AuthUser) -> anyhow::Result<()> + Send + Sync;
/// Callback allowed to rewrite a user before it is stored.
pub type UserMutateFn = dyn Fn(&mut AuthUser) -> anyhow::Result<()> + Send + Sync;
/// Callback invoked around endpoint handling.
pub type EndpointHookFn = dyn Fn(&mut EndpointHookContext) -> anyhow::Result<()> + Send + Sync;

/// Overrides for password hashing.
#[derive(Debug, Clone, Default)]
pub struct PasswordHooks {
    /// Custom hash function.
    pub hash: Option<Shared<HashPasswordFn>>,
    /// Custom verify function.
    pub verify: Option<Shared<VerifyPasswordFn>>,
}

/// Request view passed to endpoint hooks.
#[derive(Debug, Clone, Default)]
pub struct EndpointHookContext {
    /// Request path.
    pub path: String,
    /// Request method.
    pub method: String,
    /// Authenticated user, if any.
    pub user: Option<AuthUser>,
    /// Status set by an `after` hook.
    pub response_status: Option<u16>,
    /// Set by a `before` hook to skip the endpoint.
    pub handled: bool,
}

/// Hooks run before and after every auth endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointHooks {
    /// Runs before the endpoint.
    pub before: Option<Shared<EndpointHookFn>>,
    /// Runs after the endpoint produced a response.
    pub after: Option<Shared<EndpointHookFn>>,
}

/// Hooks around user persistence.
#[derive(Debug, Clone, Default)]
pub struct UserDatabaseHooks {
    /// Runs before a user row is created.
    pub before_create: Option<Shared<UserMutateFn>>,
    /// Runs after a user row is created.
    pub after_create: Option<Shared<UserHookFn>>,
    /// Runs before a user row is updated.
    pub before_update: Option<Shared<UserMutateFn>>,
    /// Runs after a user row is updated.
    pub after_update: Option<Shared<UserHookFn>>,
}

/// Persistence hooks grouped by entity.
#[derive(Debug, Clone, Default)]
pub struct DatabaseHooks {
    /// User entity hooks.
    pub users: UserDatabaseHooks,
}

/// Callbacks fired for auth lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct EventHooks {
    /// A user signed up.
    pub on_user_signed_up: Option<Shared<UserHookFn>>,
    /// A user logged in.
    pub on_user_logged_in: Option<Shared<UserHookFn>>,
    /// A user verified their email.
    pub on_email_verified: Option<Shared<UserHookFn>>,
    /// A user changed their password.
    pub on_password_changed: Option<Shared<UserHookFn>>,
    /// A user changed their email.
    pub on_email_changed: Option<Shared<UserHookFn>>,
}
