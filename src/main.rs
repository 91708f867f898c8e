// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use c12_client_rs::{
    cfg::{cli::resolve_config_path, config::ProtocolConfig, logger::init_logger},
    channel::socket::{ProxyConfig, TcpChannel},
    queue::{CommandRecord, worker::Worker},
    session::Session,
};
use tokio::sync::Mutex;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("demos/config_logger.yaml")?;

    let cfg = resolve_config_path("demos/device.yaml")
        .and_then(ProtocolConfig::load_from_file)
        .context("failed to resolve or load device config")?;

    let target: SocketAddr = "127.0.0.1:9761".parse().context("bad meter address")?;
    let channel = TcpChannel::new(target, ProxyConfig::None);

    let session = Arc::new(Mutex::new(Session::new(channel, cfg)));
    session.lock().await.connect().await.context("connect failed")?;
    info!("Connected to meter");

    session.lock().await.start_session().await.context("StartSession failed")?;
    info!("Session established");

    // Drive a couple of table reads through the queue instead of calling
    // `Session` directly, exercising the same path a real caller would use.
    let worker = Worker::new(Arc::clone(&session));
    worker.add(CommandRecord::read(1, 1)).await;
    worker.add(CommandRecord::read(3, 2)).await;
    worker.commit(false).await.context("QCommit failed")?;

    let general_configuration = worker.get_table_data(1, 1).await?;
    info!(bytes = general_configuration.len(), "Read general configuration table (ST_01)");
    let units_and_formats = worker.get_table_data(3, 2).await?;
    info!(bytes = units_and_formats.len(), "Read units/formats table (ST_03)");

    session.lock().await.end_session().await.context("EndSession failed")?;
    session.lock().await.disconnect().await;
    info!("Session closed");

    Ok(())
}
