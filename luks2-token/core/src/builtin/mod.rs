//! Handlers compiled into the token layer.

pub mod keyring;
