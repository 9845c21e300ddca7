pub mod engine;
pub mod stategraph;
