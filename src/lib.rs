pub mod cli;
pub mod notice;
pub mod process;
pub mod publish;
pub mod state;
pub mod sync;
pub mod vault;

pub use cli::run;
