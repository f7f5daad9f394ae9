// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand running the analyser process: the recordings HTTP surface and
//! the inference scheduler.

use crate::analyser::vllm::{InferenceClient, VllmClient};
use crate::analyser::{Analyser, PendingQueue};
use crate::config::Config;
use crate::web;
use base::clock::RealClocks;
use base::{bail, err, Error};
use bpaf::Bpaf;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Runs the analyser: serves the recordings directory over HTTP and drives
/// pending recordings through the vision inference endpoint.
#[derive(Bpaf, Debug, Clone)]
#[bpaf(command("analyser"))]
pub struct Args {}

pub fn run(_args: Args) -> Result<i32, Error> {
    let config = Config::from_env()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(async_run(config));
    rt.shutdown_background();
    result
}

async fn async_run(config: Config) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    use tokio::signal::unix::{signal, SignalKind};
    tokio::pin! {
        let int = signal(SignalKind::interrupt())?;
        let term = signal(SignalKind::terminate())?;
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

/// Best-effort guess of an address the inference endpoint can fetch from:
/// the local address of a UDP socket "connected" to a public resolver. No
/// packets are sent.
fn detect_host_ip() -> String {
    let detected = std::net::UdpSocket::bind(("0.0.0.0", 0)).and_then(|socket| {
        socket.connect(("8.8.8.8", 80))?;
        socket.local_addr()
    });
    match detected {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_owned(),
    }
}

async fn inner(config: Config, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let clocks = RealClocks {};
    info!("argus analyser {}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(db::Store::new(&config.database));
    if let Err(e) = super::connect_store(store.clone(), clocks).await {
        error!(err = %e.chain(), "store unreachable, exiting");
        return Ok(1);
    }

    let host_ip = config
        .analyser
        .host_ip
        .clone()
        .unwrap_or_else(detect_host_ip);
    let base_url = format!("http://{host_ip}:{}", config.analyser.server_port);
    let client: Arc<dyn InferenceClient> = Arc::new(VllmClient::new(
        clocks,
        config.analyser.vllm_api_url.clone(),
        config.analyser.vllm_model.clone(),
    )?);
    info!(
        "dispatching to {} (model {}), recordings at {base_url}/recordings/",
        config.analyser.vllm_api_url, config.analyser.vllm_model
    );

    // The scheduler runs on a plain thread: its HTTP calls block for up to
    // minutes, which has no place on the runtime. It observes shutdown
    // between items and polls; an in-flight inference call at exit is
    // abandoned with the process, exactly like a failed insert would be.
    let queue: Arc<dyn PendingQueue> = store;
    let scheduler = Analyser::new(
        clocks,
        queue,
        client,
        base_url,
        config.analyser.poll_interval,
    );
    let scheduler_shutdown = shutdown_rx.clone();
    std::thread::Builder::new()
        .name("analyser".to_owned())
        .spawn(move || {
            scheduler.wait_for_inference(&scheduler_shutdown);
            scheduler.run(&scheduler_shutdown);
        })
        .map_err(|e| err!(Internal, msg("can't spawn analyser thread"), source(e)))?;

    let service = Arc::new(web::Service::new(&config.recording.recordings_dir)?);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.analyser.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("recordings HTTP surface listening on {addr}");

    loop {
        tokio::select! {
            _ = shutdown_rx.future() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        debug!("accept failed: {e}");
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let served = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            io,
                            hyper::service::service_fn(move |req| service.clone().serve(req)),
                        )
                        .await;
                    if let Err(e) = served {
                        debug!("connection from {peer} failed: {e}");
                    }
                });
            }
        }
    }

    info!("exiting");
    Ok(0)
}
