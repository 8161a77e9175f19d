//! hosting server binary
//!
//! Runs the WebSocket server for live matchmaking and engine matches.

use blitzmatch::*;

#[tokio::main]
async fn main() {
    init();
    hosting::Server::run().await.unwrap();
}
