//! User profiles, registration and the follow relation.

use crate::context::{CallContext, Interrupted};
use crate::storage::{
    ConduitStorage, StorageError, StorageTransaction, UserInsert, UserRow, UserUpdate,
    commit_unless_interrupted, rollback_quietly,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("User not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Profile lookup failed")]
    LookupFailed(#[source] StorageError),

    #[error("Profile write failed")]
    WriteFailed(#[source] StorageError),

    #[error("Transaction failed")]
    Transaction(#[source] StorageError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl ProfileError {
    fn from_write(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => ProfileError::Conflict(msg),
            other => ProfileError::WriteFailed(other),
        }
    }
}

/// Public view of a user as seen by a (possibly anonymous) viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub username: String,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub following: bool,
}

impl ProfileView {
    pub fn from_user(user: &UserRow, following: bool) -> Self {
        Self {
            username: user.username.clone(),
            bio: user.bio.clone(),
            image: user.image.clone(),
            following,
        }
    }
}

/// Input for registering a user. The hash comes from the auth layer.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Clone)]
pub struct ProfileService<S: ConduitStorage> {
    storage: S,
}

impl<S: ConduitStorage> ProfileService<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn profile(
        &self,
        username: &str,
        viewer: Option<Uuid>,
        ctx: &CallContext,
    ) -> Result<ProfileView, ProfileError> {
        let user = ctx
            .run(self.storage.find_user_by_username(username))
            .await?
            .map_err(ProfileError::LookupFailed)?
            .ok_or_else(|| ProfileError::NotFound(username.to_owned()))?;

        let following = match viewer {
            Some(viewer) => ctx
                .run(self.storage.is_following(viewer, user.id))
                .await?
                .map_err(ProfileError::LookupFailed)?,
            None => false,
        };

        Ok(ProfileView::from_user(&user, following))
    }

    #[tracing::instrument(skip_all, fields(username = %username))]
    pub async fn follow(
        &self,
        username: &str,
        follower_id: Uuid,
        ctx: &CallContext,
    ) -> Result<ProfileView, ProfileError> {
        self.set_following(username, follower_id, true, ctx).await
    }

    #[tracing::instrument(skip_all, fields(username = %username))]
    pub async fn unfollow(
        &self,
        username: &str,
        follower_id: Uuid,
        ctx: &CallContext,
    ) -> Result<ProfileView, ProfileError> {
        self.set_following(username, follower_id, false, ctx).await
    }

    async fn set_following(
        &self,
        username: &str,
        follower_id: Uuid,
        following: bool,
        ctx: &CallContext,
    ) -> Result<ProfileView, ProfileError> {
        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(ProfileError::Transaction)?;

        let result = follow_in_tx(&mut tx, username, follower_id, following, ctx).await;
        let (view, changed) = match result {
            Ok(done) => done,
            Err(err) => {
                rollback_quietly(tx, "set_following").await;
                return Err(err);
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(ProfileError::Transaction)?;

        if changed {
            tracing::debug!(following, "Follow relation updated");
        }
        Ok(view)
    }

    /// Creates a user. Username and email must be unique and non-empty.
    #[tracing::instrument(skip_all, fields(username = %input.username))]
    pub async fn register(&self, input: NewUser, ctx: &CallContext) -> Result<UserRow, ProfileError> {
        if input.username.trim().is_empty() {
            return Err(ProfileError::Validation("username must not be empty".to_owned()));
        }
        if input.email.trim().is_empty() {
            return Err(ProfileError::Validation("email must not be empty".to_owned()));
        }

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(ProfileError::Transaction)?;

        let inserted = ctx
            .run(tx.insert_user(UserInsert {
                username: input.username,
                email: input.email,
                password_hash: input.password_hash,
            }))
            .await;
        let user = match inserted {
            Ok(Ok(user)) => user,
            Ok(Err(err)) => {
                rollback_quietly(tx, "register").await;
                return Err(ProfileError::from_write(err));
            }
            Err(interrupted) => {
                rollback_quietly(tx, "register").await;
                return Err(interrupted.into());
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(ProfileError::from_write)?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Applies a partial update to the user's account and profile fields.
    pub async fn update_user(
        &self,
        user_id: Uuid,
        changes: UserUpdate,
        ctx: &CallContext,
    ) -> Result<UserRow, ProfileError> {
        if changes.email.as_deref().is_some_and(|e| e.trim().is_empty()) {
            return Err(ProfileError::Validation("email must not be empty".to_owned()));
        }

        let mut tx = ctx
            .run(self.storage.begin())
            .await?
            .map_err(ProfileError::Transaction)?;

        let updated = ctx.run(tx.update_user(user_id, changes)).await;
        let user = match updated {
            Ok(Ok(user)) => user,
            Ok(Err(StorageError::NotFound(_))) => {
                rollback_quietly(tx, "update_user").await;
                return Err(ProfileError::NotFound(user_id.to_string()));
            }
            Ok(Err(err)) => {
                rollback_quietly(tx, "update_user").await;
                return Err(ProfileError::from_write(err));
            }
            Err(interrupted) => {
                rollback_quietly(tx, "update_user").await;
                return Err(interrupted.into());
            }
        };

        commit_unless_interrupted(tx, ctx)
            .await?
            .map_err(ProfileError::from_write)?;
        Ok(user)
    }
}

async fn follow_in_tx<T: StorageTransaction>(
    tx: &mut T,
    username: &str,
    follower_id: Uuid,
    following: bool,
    ctx: &CallContext,
) -> Result<(ProfileView, bool), ProfileError> {
    let target = ctx
        .run(tx.find_user_by_username(username))
        .await?
        .map_err(ProfileError::LookupFailed)?
        .ok_or_else(|| ProfileError::NotFound(username.to_owned()))?;

    if target.id == follower_id {
        return Err(ProfileError::Validation("cannot follow yourself".to_owned()));
    }

    let written = if following {
        ctx.run(tx.create_follow(follower_id, target.id)).await?
    } else {
        ctx.run(tx.delete_follow(follower_id, target.id)).await?
    };
    let changed = written.map_err(ProfileError::WriteFailed)?;

    Ok((ProfileView::from_user(&target, following), changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FailPoint, MockConduitStorage};

    fn setup() -> (MockConduitStorage, UserRow, UserRow) {
        let alice = UserRow::new("alice", "alice@example.com", "hash");
        let bob = UserRow::new("bob", "bob@example.com", "hash");
        let storage = MockConduitStorage::new()
            .with_user(alice.clone())
            .with_user(bob.clone());
        (storage, alice, bob)
    }

    #[tokio::test]
    async fn test_follow_is_idempotent() {
        let (storage, alice, bob) = setup();
        let service = ProfileService::new(storage.clone());
        let ctx = CallContext::background();

        let first = service.follow("bob", alice.id, &ctx).await.unwrap();
        let second = service.follow("bob", alice.id, &ctx).await.unwrap();

        assert!(first.following && second.following);
        assert_eq!(storage.write_log().len(), 1);
        assert!(storage.is_following(alice.id, bob.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unfollow_without_follow_is_noop() {
        let (storage, alice, _) = setup();
        let service = ProfileService::new(storage.clone());

        let view = service
            .unfollow("bob", alice.id, &CallContext::background())
            .await
            .unwrap();

        assert!(!view.following);
        assert!(storage.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_cannot_follow_self() {
        let (storage, alice, _) = setup();
        let service = ProfileService::new(storage);

        let err = service
            .follow("alice", alice.id, &CallContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, ProfileError::Validation(_)));
    }

    #[tokio::test]
    async fn test_profile_reports_following_for_viewer() {
        let (storage, alice, bob) = setup();
        let storage = storage.with_follow(alice.id, bob.id);
        let service = ProfileService::new(storage);

        let ctx = CallContext::background();

        let seen_by_alice = service.profile("bob", Some(alice.id), &ctx).await.unwrap();
        let anonymous = service.profile("bob", None, &ctx).await.unwrap();

        assert!(seen_by_alice.following);
        assert!(!anonymous.following);
    }

    #[tokio::test]
    async fn test_profile_read_honors_cancellation() {
        let (storage, _, _) = setup();
        let service = ProfileService::new(storage);
        let ctx = CallContext::background();
        ctx.cancel();

        let err = service.profile("bob", None, &ctx).await.unwrap_err();

        assert!(matches!(err, ProfileError::Interrupted(Interrupted::Cancelled)));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_username() {
        let (storage, _, _) = setup();
        let service = ProfileService::new(storage);

        let err = service
            .register(
                NewUser {
                    username: "alice".to_owned(),
                    email: "other@example.com".to_owned(),
                    password_hash: "hash".to_owned(),
                },
                &CallContext::background(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProfileError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_empty_username() {
        let (storage, _, _) = setup();
        let service = ProfileService::new(storage);

        let err = service
            .register(
                NewUser {
                    username: "  ".to_owned(),
                    email: "x@example.com".to_owned(),
                    password_hash: "hash".to_owned(),
                },
                &CallContext::background(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProfileError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_user_clears_bio() {
        let (storage, alice, _) = setup();
        let service = ProfileService::new(storage);
        let ctx = CallContext::background();

        let updated = service
            .update_user(
                alice.id,
                UserUpdate {
                    bio: Some(Some("hello".to_owned())),
                    ..UserUpdate::default()
                },
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(updated.bio.as_deref(), Some("hello"));

        let cleared = service
            .update_user(
                alice.id,
                UserUpdate {
                    bio: Some(None),
                    ..UserUpdate::default()
                },
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(cleared.bio, None);
    }

    #[tokio::test]
    async fn test_follow_write_failure() {
        let (storage, alice, _) = setup();
        storage.fail_on(FailPoint::CreateFollow);
        let service = ProfileService::new(storage);

        let err = service
            .follow("bob", alice.id, &CallContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, ProfileError::WriteFailed(_)));
    }
}
