pub mod discover;
pub mod executor;
pub mod graph;
pub mod layout;
pub mod manifest;
pub mod platform;
pub mod reference;
pub mod report;
pub mod retry;
pub mod source;
