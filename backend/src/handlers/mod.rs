pub mod files;
pub mod health;
pub mod predictions;
pub mod tasks;
