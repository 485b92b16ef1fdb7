pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod rooms;
pub mod routes;
pub mod service;
pub mod tasks;
pub mod voting;
