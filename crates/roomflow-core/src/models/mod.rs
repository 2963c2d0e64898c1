pub mod instance;
pub mod task;
pub mod template;

pub use instance::*;
pub use task::*;
pub use template::*;
