// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod analyser;
pub mod detector;

use base::clock::Clocks;
use std::sync::Arc;
use std::time::Duration;

/// Store connection policy shared by both processes; whether failure is
/// fatal differs (analyser: yes, detector: no).
const STORE_CONNECT_RETRIES: usize = 10;
const STORE_CONNECT_DELAY: Duration = Duration::from_secs(3);

/// Dials the store on a blocking thread so the async entrypoints don't
/// stall their runtime during the retry window.
async fn connect_store<C: Clocks + Clone>(
    store: Arc<db::Store>,
    clocks: C,
) -> Result<(), base::Error> {
    tokio::task::spawn_blocking(move || {
        store.connect_with_retries(&clocks, STORE_CONNECT_RETRIES, STORE_CONNECT_DELAY)
    })
    .await
    .expect("store connect task panicked")
}
