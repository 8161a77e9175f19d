mod client;
mod engine;
mod events;
mod matchmaking;
mod server;

pub use client::*;
pub use engine::*;
pub use events::*;
pub use matchmaking::*;
pub use server::*;
