pub mod emit;
pub mod rooms;
pub mod subscriptions;
