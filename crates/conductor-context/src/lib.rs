pub mod builder;
pub mod keywords;
pub mod score;
pub mod sources;

pub use builder::*;
pub use keywords::*;
pub use score::*;
pub use sources::*;
