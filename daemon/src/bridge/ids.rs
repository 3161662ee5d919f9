// Task id generation
// Ids are short random tokens with a readable prefix, e.g. `task_3f9c0a1b22de`

use rand::RngCore;

/// Prefix on every generated task id
pub const TASK_ID_PREFIX: &str = "task_";

const RANDOM_BYTES: usize = 6;

/// Source of fresh task ids
pub trait TaskIdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Draws ids from the thread-local, OS-seeded CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl TaskIdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; RANDOM_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{}{}", TASK_ID_PREFIX, hex::encode(bytes))
    }
}
