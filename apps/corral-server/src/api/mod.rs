pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

#[cfg(test)]
mod tests;
