pub mod audit_repo;
pub mod idempotency_repo;
pub mod outbox_repo;
pub mod user_repo;
