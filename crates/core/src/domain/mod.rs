pub mod action;
pub mod job;
pub mod model;
pub mod snapshot;
pub mod winner;
