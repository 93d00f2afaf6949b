pub mod events;
pub mod models;
pub mod parts;
pub mod relay;
pub mod runs;
