pub mod kiro_store;

pub use kiro_store::{KiroCredentialStore, KiroCredentials};
