pub mod queue;
pub mod retention;
pub mod worker;
pub mod writer;
