//! Text-to-image generation by iterative latent refinement, streamed as NDJSON.

pub mod config;
pub mod decoder;
pub mod encode;
pub mod events;
pub mod latent;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod progress;
pub mod refine;
pub mod routes;
pub mod session;
