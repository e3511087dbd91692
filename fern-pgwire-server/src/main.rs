// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;

use fern_pgwire::{Engine, DEFAULT_SERVER_VERSION};
use fern_pgwire_interfaces::ServerContext;
use fern_session_embedded::{EmbeddedAuthentication, EmbeddedSessionFactory};

mod server;
mod shutdown;

/// Loads settings from the TOML file named by `CONFIG_FILE`, over defaults.
fn load_config() -> Result<config::Config, config::ConfigError> {
    let mut builder = config::Config::builder()
        .set_default("server.max_connections", server::DEFAULT_MAX_CONNECTIONS as i64)?
        .set_default("server.version", DEFAULT_SERVER_VERSION)?
        .set_default("auth.method", "trust")?;

    // No `CONFIG_FILE` defined results in defaults only.
    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        log::debug!("loading config file: '{}'", config_file);
        builder = builder.add_source(config::File::new(&config_file, config::FileFormat::Toml));
    }

    builder.build()
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    // Per "12 factors: III. Config", store config in the environment.
    let own_addr = std::env::var("ADDRESS").unwrap_or_else(|_| "0.0.0.0:5432".into());
    log::trace!("listener addr: {}", own_addr);

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            log::error!("aborting - {}", err);
            return ExitCode::FAILURE;
        }
    };
    log::trace!("using config: {:?}", config);

    let context = ServerContext::new(config);
    let mut engine = Engine::new(
        Arc::new(EmbeddedAuthentication::new(&context)),
        Arc::new(EmbeddedSessionFactory::new(&context)),
    );
    if let Ok(version) = context.config.get::<String>("server.version") {
        engine = engine.with_server_version(version);
    }

    let listener = match TcpListener::bind(&own_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("aborting - failed binding {}: {}", own_addr, err);
            return ExitCode::FAILURE;
        }
    };

    // Stops on SIGINT.
    server::run(listener, Arc::new(engine), tokio::signal::ctrl_c(), &context).await;
    log::info!("server shut down; exiting");
    ExitCode::SUCCESS
}
