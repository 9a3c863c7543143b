pub mod control;
pub mod edits;
pub mod events;
pub mod jobs;
pub mod regions;
pub mod settings;
