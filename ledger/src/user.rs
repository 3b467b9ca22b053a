//! User rows and the user-creation composite parameters.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// A bank customer. Owns accounts by username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Password hash produced by the caller.
    #[serde(skip_serializing, default)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    /// Last password change. `UNIX_EPOCH` until the first change.
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for `create_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// Parameters for `update_user`. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

type HookFn = Box<dyn FnOnce(User) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Side effect run inside the user-creation transaction, before commit.
///
/// A failing hook rolls back the user insert.
pub struct AfterCreate(HookFn);

impl AfterCreate {
    /// Wrap an async callback invoked with the created user.
    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self(Box::new(move |user| Box::pin(hook(user))))
    }

    /// A hook that does nothing.
    pub fn noop() -> Self {
        Self::new(|_| async { Ok::<(), BoxError>(()) })
    }

    pub(crate) async fn run(self, user: User) -> Result<(), BoxError> {
        (self.0)(user).await
    }
}

impl fmt::Debug for AfterCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AfterCreate")
    }
}

/// Input of the user-creation composite operation.
#[derive(Debug)]
pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreate,
}

/// Result of the user-creation composite operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserTxResult {
    pub user: User,
}
