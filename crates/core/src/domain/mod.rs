pub mod history;
pub mod run;
pub mod snapshot;
pub mod symbol;
