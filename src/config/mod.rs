use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{REGISTRATION_PORT, SERVICE_PORT, STORAGE_CLIENT_PORT, STORAGE_COMMAND_PORT};

/// WireFs — distributed filesystem with one naming server and any number of
/// storage servers.
#[derive(Parser, Debug)]
#[command(name = "wirefs", about = "Distributed filesystem servers")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: ServerCommand,
}

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// Run the naming server (metadata authority).
    Naming {
        /// Port of the client-facing service interface.
        #[arg(long, default_value_t = SERVICE_PORT)]
        service_port: u16,

        /// Port of the storage-facing registration interface.
        #[arg(long, default_value_t = REGISTRATION_PORT)]
        registration_port: u16,
    },

    /// Run a storage server over a local directory.
    Storage {
        /// Directory whose contents this server exposes.
        #[arg(short, long)]
        root: PathBuf,

        /// Port of the client (byte access) interface (0 = OS-assigned).
        #[arg(long, default_value_t = STORAGE_CLIENT_PORT)]
        client_port: u16,

        /// Port of the command interface (0 = OS-assigned).
        #[arg(long, default_value_t = STORAGE_COMMAND_PORT)]
        command_port: u16,

        /// Host the naming server runs on.
        #[arg(long, default_value = "127.0.0.1")]
        naming_host: String,

        /// Registration port of the naming server.
        #[arg(long, default_value_t = REGISTRATION_PORT)]
        naming_port: u16,

        /// Externally-routable hostname of this host (default: the system
        /// hostname).
        #[arg(long)]
        hostname: Option<String>,
    },
}

/// Resolved configuration for a storage server run.
pub struct StorageConfig {
    pub root: PathBuf,
    pub client_port: u16,
    pub command_port: u16,
    pub naming_host: String,
    pub naming_port: u16,
    pub hostname: String,
}

impl StorageConfig {
    pub fn resolve(
        root: PathBuf,
        client_port: u16,
        command_port: u16,
        naming_host: String,
        naming_port: u16,
        hostname_override: Option<String>,
    ) -> anyhow::Result<Self> {
        let hostname = match hostname_override {
            Some(name) => name,
            None => hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string()),
        };
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            client_port,
            command_port,
            naming_host,
            naming_port,
            hostname,
        })
    }
}
