mod app;
mod health;
mod orders;
mod users;

pub use app::app;
