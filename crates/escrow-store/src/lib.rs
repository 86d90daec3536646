pub mod fold;
pub mod memory;
pub mod mirror;

pub use fold::{DealFold, catch_up, replay_from_genesis};
pub use memory::{InMemoryCache, InMemoryLog};
pub use mirror::{MIRROR_PAGE_LIMIT, MirrorLogReader};
