//! Known users, looked up by sender address.

pub mod users;

pub use users::{StaticUserStore, UserStore};
