pub mod envelope;
pub mod errors;
pub mod events;
pub mod intent;
pub mod invocation;
pub mod models;
