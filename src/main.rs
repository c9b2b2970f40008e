use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use wirefs::api::RegistrationStub;
use wirefs::config::{CliArgs, ServerCommand, StorageConfig};
use wirefs::naming::NamingServer;
use wirefs::storage::StorageServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    match args.command {
        ServerCommand::Naming {
            service_port,
            registration_port,
        } => {
            let server = Arc::new(NamingServer::with_ports(service_port, registration_port));
            server
                .clone()
                .start()
                .await
                .context("starting the naming server")?;
            info!(
                service = ?server.service_addr(),
                registration = ?server.registration_addr(),
                "naming server running"
            );

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            server.stop().await;
        }

        ServerCommand::Storage {
            root,
            client_port,
            command_port,
            naming_host,
            naming_port,
            hostname,
        } => {
            let config = StorageConfig::resolve(
                root,
                client_port,
                command_port,
                naming_host,
                naming_port,
                hostname,
            )?;
            let naming = RegistrationStub::from_addr(&config.naming_host, config.naming_port)
                .context("building the registration stub")?;

            let server = Arc::new(StorageServer::with_ports(
                config.root.clone(),
                config.client_port,
                config.command_port,
            ));
            server
                .clone()
                .start(&config.hostname, &naming)
                .await
                .context("starting the storage server")?;
            info!(
                root = %config.root.display(),
                client = ?server.client_addr(),
                command = ?server.command_addr(),
                "storage server running"
            );

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            server.stop().await;
        }
    }

    info!("goodbye");
    Ok(())
}
