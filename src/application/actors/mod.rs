pub mod sweeper_actor;

pub use sweeper_actor::{SweeperActor, SweeperMessage, SweeperStats};
