pub mod events;
pub mod images;
pub mod requests;
