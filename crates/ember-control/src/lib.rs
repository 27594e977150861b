pub mod agent_client;
pub mod app;
pub mod auth;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod gate;
pub mod inactivity;
pub mod security;
pub mod state;
pub mod vm;
pub mod vm_cloud;
pub mod vm_local;
pub mod vm_poller;
pub mod vm_routes;

#[cfg(test)]
mod testing;
