//! User write-side: create with idempotency and outbox, read by id

use crate::idempotency::{AggregateRef, CommandError, CommandOutcome, IdempotentCommandHandler};
use crate::models::{NewOutboxEvent, User, UserCreatedPayload, USER_AGGREGATE_TYPE, USER_CREATED_EVENT};
use crate::store::{CommandStore, UnitOfWork, UserReader};
use chrono::{SubsecRound, Utc};
use futures::FutureExt;
use tracing::info;
use uuid::Uuid;

impl AggregateRef for User {
    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
}

impl CreateUser {
    fn validate(&self) -> Result<(String, String), CommandError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CommandError::Validation("name is required".to_string()));
        }
        let email = self.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(CommandError::Validation(format!("invalid email: {}", self.email)));
        }
        Ok((name.to_string(), email))
    }
}

pub struct UserService<S> {
    handler: IdempotentCommandHandler<S>,
}

impl<S> UserService<S>
where
    S: CommandStore + UserReader,
{
    pub fn new(store: S) -> Self {
        Self {
            handler: IdempotentCommandHandler::new(store),
        }
    }

    /// Create a user and its `user.created` outbox event in one transaction.
    ///
    /// Returns the user and whether it was replayed from an earlier request
    /// carrying the same idempotency key.
    pub async fn create(
        &self,
        input: CreateUser,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<(User, bool), CommandError> {
        let (name, email) = input.validate()?;
        let user = User {
            id: Uuid::new_v4(),
            name,
            email,
            // Postgres keeps microseconds; match it so replays compare equal
            created_at: Utc::now().trunc_subsecs(6),
        };
        let payload = serde_json::to_vec(&UserCreatedPayload::from(&user))?;
        let event = NewOutboxEvent::new(
            USER_AGGREGATE_TYPE,
            user.id.to_string(),
            USER_CREATED_EVENT,
            payload,
        );

        let outcome = self
            .handler
            .execute(idempotency_key, request_hash, move |tx| {
                async move {
                    tx.insert_user(&user).await?;
                    tx.insert_outbox_event(&event).await?;
                    Ok(user)
                }
                .boxed()
            })
            .await?;

        match outcome {
            CommandOutcome::Applied(user) => {
                info!(user_id = %user.id, "User created");
                Ok((user, false))
            }
            CommandOutcome::Replayed { aggregate_id } => {
                let id = Uuid::parse_str(&aggregate_id).map_err(|_| {
                    CommandError::NotFound(format!("replayed aggregate id {}", aggregate_id))
                })?;
                let user = self
                    .handler
                    .store()
                    .get_user_consistent(id)
                    .await?
                    .ok_or_else(|| CommandError::NotFound(format!("user {}", id)))?;
                info!(user_id = %user.id, idempotency_key = %idempotency_key, "User create replayed");
                Ok((user, true))
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<User, CommandError> {
        self.handler
            .store()
            .get_user(id)
            .await?
            .ok_or_else(|| CommandError::NotFound(format!("user {}", id)))
    }
}
