//! Random client id generation
//!
//! Ids are 16 alphanumeric characters. A generator remembers the last few
//! ids it issued and never repeats one of those. Uniqueness beyond that
//! window, or across generators, is only as strong as the randomness.

use std::collections::VecDeque;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated ids
pub const ID_LENGTH: usize = 16;

/// How many recent ids a generator refuses to repeat
const RECENT_WINDOW: usize = 64;

#[derive(Debug, Default)]
pub struct IdGenerator {
    recent: VecDeque<String>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh id
    pub fn generate(&mut self) -> String {
        loop {
            let id = random_id();
            if self.recent.contains(&id) {
                continue;
            }
            if self.recent.len() == RECENT_WINDOW {
                self.recent.pop_front();
            }
            self.recent.push_back(id.clone());
            return id;
        }
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}
