pub mod anchor;
pub mod outbox;
pub mod store;
