use super::Clock;
use crate::hosting::Client;
use std::sync::Arc;

/// A seated participant: the connection it arrived on plus the clock it is
/// granted once the match starts.
pub struct Player<T> {
    pub client: Arc<Client<T>>,
    pub clock: Option<Clock>,
}

impl<T> Player<T> {
    pub fn new(client: Arc<Client<T>>) -> Self {
        Self {
            client,
            clock: None,
        }
    }
}
