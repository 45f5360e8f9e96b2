pub mod auth;
pub mod calendar;
pub mod output;
