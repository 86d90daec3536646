pub mod memory;
pub mod rpc;

pub use memory::InMemoryLedger;
pub use rpc::{JsonRpcLedger, JsonRpcTopicWriter};
