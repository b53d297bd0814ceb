pub mod events;
pub mod figure;
pub mod models;
pub mod runs;
