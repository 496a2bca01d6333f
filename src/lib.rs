pub mod activity;
pub mod aggregator;
pub mod api;
pub mod channels;
pub mod config;
pub mod destination;
pub mod edit;
pub mod error;
pub mod event;
pub mod gateway;
pub mod mapping;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod supabase;
pub mod transfer;

#[cfg(test)]
mod testing;
