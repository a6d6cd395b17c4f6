pub mod channel;
pub mod coordinator;
pub mod reconnect;
pub mod signer;

pub use channel::*;
pub use coordinator::*;
pub use reconnect::*;
pub use signer::*;
