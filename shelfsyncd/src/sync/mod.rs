pub mod duplicates;
pub mod engine;
pub mod observer;
pub mod prefetch;
pub mod sequencer;
