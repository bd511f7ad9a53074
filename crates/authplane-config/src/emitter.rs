//! Fan-out of auth lifecycle events to configured hooks and the event bus.

use std::time::Duration;

use authplane_events::{Event, EventBus};
use tokio::time::timeout;
use tracing::warn;

use crate::hooks::{AuthUser, EventHooks, Shared, UserHookFn};
use crate::manager::ConfigManager;

/// Event type published after sign-up.
pub const EVENT_USER_SIGNED_UP: &str = "user.signed_up";
/// Event type published after a successful login.
pub const EVENT_USER_LOGGED_IN: &str = "user.logged_in";
/// Event type published once an email is verified.
pub const EVENT_EMAIL_VERIFIED: &str = "user.email_verified";
/// Event type published after a password change.
pub const EVENT_PASSWORD_CHANGED: &str = "user.password_changed";
/// Event type published after an email change.
pub const EVENT_EMAIL_CHANGED: &str = "user.email_changed";

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_SOURCE: &str = "auth_service";

/// Dispatches auth events without blocking the caller.
///
/// Hooks run on the blocking pool and bus publishes run on their own task,
/// so neither can fail or delay the business operation that triggered them.
#[derive(Debug, Clone)]
pub struct AuthEventEmitter {
    config: ConfigManager,
    bus: Option<EventBus>,
}

impl AuthEventEmitter {
    /// Build an emitter. `bus` may be absent when events are not wired.
    #[must_use]
    pub const fn new(config: ConfigManager, bus: Option<EventBus>) -> Self {
        Self { config, bus }
    }

    /// A user signed up.
    pub fn user_signed_up(&self, user: &AuthUser) {
        self.emit(EVENT_USER_SIGNED_UP, user, |hooks| &hooks.on_user_signed_up);
    }

    /// A user logged in.
    pub fn user_logged_in(&self, user: &AuthUser) {
        self.emit(EVENT_USER_LOGGED_IN, user, |hooks| &hooks.on_user_logged_in);
    }

    /// A user verified their email.
    pub fn email_verified(&self, user: &AuthUser) {
        self.emit(EVENT_EMAIL_VERIFIED, user, |hooks| &hooks.on_email_verified);
    }

    /// A user changed their password.
    pub fn password_changed(&self, user: &AuthUser) {
        self.emit(EVENT_PASSWORD_CHANGED, user, |hooks| {
            &hooks.on_password_changed
        });
    }

    /// A user changed their email.
    pub fn email_changed(&self, user: &AuthUser) {
        self.emit(EVENT_EMAIL_CHANGED, user, |hooks| &hooks.on_email_changed);
    }

    fn emit(
        &self,
        event_type: &'static str,
        user: &AuthUser,
        select: impl Fn(&EventHooks) -> &Option<Shared<UserHookFn>>,
    ) {
        let config = self.config.config();

        if let Some(hook) = select(&config.event_hooks).clone() {
            let user = user.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(err) = hook(&user) {
                    warn!(event_type, error = %err, "event hook failed");
                }
            });
        }

        if !config.event_bus.enabled {
            return;
        }
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let payload = match serde_json::to_value(user) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event_type, error = %err, "failed to encode event payload");
                return;
            }
        };
        let event = Event::new(event_type, payload).with_metadata("source", EVENT_SOURCE);
        tokio::spawn(async move {
            match timeout(PUBLISH_TIMEOUT, bus.publish(&event)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(event_type, error = %err, "failed to publish event"),
                Err(_) => warn!(event_type, "event publish timed out"),
            }
        });
    }
}
