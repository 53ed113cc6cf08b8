//! leproxy - Let's Encrypt provisioning for an nginx reverse proxy.
//!
//! Obtains a certificate through certbot's standalone HTTP-01 flow while a
//! bootstrap proxy keeps the public side answering, switches nginx to TLS
//! termination once the certificate exists, and renews it periodically.

pub mod certificate;
pub mod config;
pub mod error;
pub mod gate;
pub mod issuer;
pub mod orchestrator;
pub mod process;
pub mod proxy;
pub mod shutdown;
pub mod templates;

pub use error::AppError;
