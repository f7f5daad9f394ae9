// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Stream discovery against the media server's HTTP API.
//!
//! Failures here never disturb running pipelines: any connection, timeout, or
//! parse problem logs a warning and yields an empty list, which the manager
//! treats as "nothing discovered this cycle".

use base::{err, Error};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One stream known to the media server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Path-like id, e.g. `live/cam1`. May contain `/`.
    pub stream_id: String,
    pub display_name: String,
    pub ready: bool,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Filesystem- and label-safe form of a stream id: path separators become
/// `_`. Within one run this is used consistently for scratch directories,
/// segment prefixes, and recording layout, so it round-trips with the id.
pub fn stream_key(stream_id: &str) -> String {
    stream_id.replace('/', "_")
}

#[derive(Deserialize)]
struct PathList {
    #[serde(default)]
    items: Vec<PathItem>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PathItem {
    name: String,
    ready: bool,
    source: Option<PathSource>,
    bytes_received: u64,
    bytes_sent: u64,
}

#[derive(Deserialize, Default)]
struct PathSource {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
}

pub struct Discoverer {
    /// Manual stream list; set when `RTSP_STREAMS` overrides the API.
    manual: Option<Vec<String>>,
    paths_url: String,
    client: reqwest::blocking::Client,
}

impl Discoverer {
    pub fn new(api_url: &str, manual: Option<Vec<String>>) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .map_err(|e| err!(Internal, msg("unable to build discovery client"), source(e)))?;
        Ok(Discoverer {
            manual,
            paths_url: format!("{api_url}/v3/paths/list"),
            client,
        })
    }

    /// Returns the streams visible right now; empty on any failure.
    pub fn discover(&self) -> Vec<StreamDescriptor> {
        if let Some(manual) = &self.manual {
            return manual
                .iter()
                .map(|id| StreamDescriptor {
                    stream_id: id.clone(),
                    display_name: id.clone(),
                    ready: true,
                    source_type: None,
                    source_url: None,
                    bytes_in: 0,
                    bytes_out: 0,
                })
                .collect();
        }

        let response = match self.client.get(&self.paths_url).send() {
            Ok(r) => r,
            Err(e) => {
                warn!("cannot reach media server API at {}: {e}", self.paths_url);
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            warn!("media server API returned status {}", response.status());
            return Vec::new();
        }
        let body = match response.text() {
            Ok(b) => b,
            Err(e) => {
                warn!("failed reading media server API response: {e}");
                return Vec::new();
            }
        };
        match parse_path_list(&body) {
            Ok(streams) => {
                let ready: Vec<&str> = streams
                    .iter()
                    .filter(|s| s.ready)
                    .map(|s| s.stream_id.as_str())
                    .collect();
                debug!(
                    "discovered {} streams, {} ready: {ready:?}",
                    streams.len(),
                    ready.len()
                );
                streams
            }
            Err(e) => {
                warn!(err = %e.chain(), "failed to parse media server path list");
                Vec::new()
            }
        }
    }
}

fn parse_path_list(body: &str) -> Result<Vec<StreamDescriptor>, Error> {
    let list: PathList = serde_json::from_str(body)
        .map_err(|e| err!(InvalidArgument, msg("bad path list payload"), source(e)))?;
    Ok(list
        .items
        .into_iter()
        .filter(|item| !item.name.is_empty())
        .map(|item| StreamDescriptor {
            display_name: item.name.clone(),
            stream_id: item.name,
            ready: item.ready,
            source_type: item.source.as_ref().and_then(|s| s.kind.clone()),
            source_url: item.source.as_ref().and_then(|s| s.id.clone()),
            bytes_in: item.bytes_received,
            bytes_out: item.bytes_sent,
        })
        .collect())
}
