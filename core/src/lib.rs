pub mod error;
pub mod features;
pub mod report;
pub mod tasks;
pub mod tracker;
