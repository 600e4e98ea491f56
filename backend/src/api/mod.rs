pub mod jobs;
pub mod notices;

pub use jobs::*;
pub use notices::*;
