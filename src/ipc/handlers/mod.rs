pub mod core;
pub mod grades;
pub mod marking;
pub mod notifications;
pub mod roster;
pub mod setup;
