pub mod health;
pub mod saml;

pub use health::health_check;
