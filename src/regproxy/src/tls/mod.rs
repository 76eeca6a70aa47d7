pub mod server;

pub use server::{
    install_crypto_provider, rustls_config_for_entry, rustls_config_from_files,
    server_config_from_pem,
};
