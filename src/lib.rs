//! Security trust core: envelope-encryption key hierarchy, session
//! lifecycle management and request admission control.

pub mod admission;
pub mod audit;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod repositories;
pub mod routes;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod kdf;
    pub mod key_cache;
    pub mod token;
}

pub mod models {
    pub mod key;
    pub mod session;
}

pub mod services {
    pub mod keys;
    pub mod sessions;
}

pub mod handlers {
    pub mod keys;
    pub mod session;
}

pub mod middleware_layer {
    pub mod admission;
    pub mod auth;
}

pub mod validation {
    pub mod request;
}

pub use config::{Config, PolicyHandle, SecurityPolicy};
pub use error::{AppError, Result};
pub use state::AppState;
