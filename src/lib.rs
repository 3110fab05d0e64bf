pub mod engine;
pub mod matcher;
pub mod readings;
pub mod record;
pub mod report;
pub mod schedule;
pub mod store;
