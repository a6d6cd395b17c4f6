pub mod config;
pub mod initdata;
pub mod messages;
pub mod models;
pub mod utils;

pub use config::*;
pub use messages::*;
pub use utils::*;
