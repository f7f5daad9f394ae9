// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway to the shared PostgreSQL store.
//!
//! The schema is owned by an external migration service (see `schema.sql` for
//! a reference copy); this crate only reads and writes rows. [`Store`] is an
//! explicit value passed into the detector and analyser; there is no
//! process-global connection. Internally it holds one lazily (re)connected
//! client: any operation that fails with a closed connection drops the client
//! so the next operation dials again.

use base::{err, Error, Mutex};
use postgres::types::ToSql;
use postgres::NoTls;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const INSERT_RECORDING_SQL: &str = r#"
    insert into recordings (stream_id, filename, filepath, recorded_at)
    values ($1, $2, $3, $4)
"#;

const UPSERT_STREAM_SQL: &str = r#"
    insert into streams (stream_id, name, source_type, source_url, ready,
                         bytes_received, bytes_sent, last_seen_at, updated_at)
    values ($1, $2, $3, $4, $5, $6, $7, current_timestamp, current_timestamp)
    on conflict (stream_id) do update set
        name = coalesce(excluded.name, streams.name),
        source_type = coalesce(excluded.source_type, streams.source_type),
        source_url = coalesce(excluded.source_url, streams.source_url),
        ready = excluded.ready,
        bytes_received = excluded.bytes_received,
        bytes_sent = excluded.bytes_sent,
        last_seen_at = current_timestamp,
        updated_at = current_timestamp
"#;

const MARK_STREAMS_OFFLINE_SQL: &str = r#"
    update streams
    set ready = false, updated_at = current_timestamp
    where ready = true and stream_id <> all($1)
"#;

const MARK_ALL_STREAMS_OFFLINE_SQL: &str = r#"
    update streams
    set ready = false, updated_at = current_timestamp
    where ready = true
"#;

const DETECTOR_CONFIG_SQL: &str = r#"
    select enabled, crop_x1, crop_y1, crop_x2, crop_y2, sensitivity
    from detector_configs
    where stream_id = $1
"#;

const LIST_PENDING_SQL: &str = r#"
    select r.id, r.stream_id, r.filename, r.filepath
    from recordings r
    left join analysis a on r.id = a.recording_id
    where a.id is null
    order by r.stream_id, r.recorded_at
"#;

const INSERT_ANALYSIS_SQL: &str = r#"
    insert into analysis (recording_id, description, danger, danger_level,
                          danger_details, raw_response, error)
    values ($1, $2, $3, $4, $5, $6, $7)
"#;

/// A durable recording row to insert after a segment copy succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingToInsert {
    pub stream_id: String,
    pub filename: String,
    /// Path relative to the recordings directory.
    pub filepath: String,
    /// Modification time of the source segment.
    pub recorded_at: SystemTime,
}

/// Camera metadata from discovery, mirrored into the `streams` table.
#[derive(Clone, Debug, Default)]
pub struct StreamUpsert {
    pub stream_id: String,
    pub name: Option<String>,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub ready: bool,
    pub bytes_received: i64,
    pub bytes_sent: i64,
}

/// A recording with no analysis row yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRecording {
    pub id: i64,
    pub stream_id: String,
    pub filename: String,
    pub filepath: String,
}

/// Exactly one of these is written per processed recording: either a parsed
/// verdict or an error marker, never neither.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalysisToInsert {
    pub recording_id: i64,
    pub description: Option<String>,
    pub danger: bool,
    pub danger_level: i32,
    pub danger_details: Option<String>,
    pub raw_response: Option<String>,
    pub error: Option<String>,
}

/// Per-stream motion detector overrides, if operators have set any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectorConfigRow {
    pub enabled: bool,
    pub crop: Option<(i32, i32, i32, i32)>,
    pub sensitivity: Option<i32>,
}

/// Connection parameters, from the `DB_*` environment surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl ConnectOptions {
    fn to_pg_config(&self) -> postgres::Config {
        let mut c = postgres::Config::new();
        c.host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .application_name("argus");
        c
    }
}

fn db_err(e: postgres::Error) -> Error {
    err!(Unavailable, msg("database operation failed"), source(e))
}

pub struct Store {
    config: postgres::Config,
    client: Mutex<Option<postgres::Client>>,
}

impl Store {
    pub fn new(options: &ConnectOptions) -> Self {
        Store {
            config: options.to_pg_config(),
            client: Mutex::new(None),
        }
    }

    /// Verifies connectivity, dialing up to `max_retries` times with
    /// `retry_delay` in between. Callers decide whether failure is fatal:
    /// the analyser exits, the detector proceeds and relies on the lazy
    /// reconnect.
    pub fn connect_with_retries<C: base::clock::Clocks>(
        &self,
        clocks: &C,
        max_retries: usize,
        retry_delay: Duration,
    ) -> Result<(), Error> {
        for attempt in 1..=max_retries {
            match self.check() {
                Ok(()) => {
                    info!("database connection established");
                    return Ok(());
                }
                Err(e) if attempt < max_retries => {
                    warn!(
                        err = %e.chain(),
                        "database connection failed (attempt {attempt}/{max_retries})"
                    );
                    clocks.sleep(retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
        Err(err!(Unavailable, msg("database unreachable")))
    }

    /// Runs `f` against the (re)connected client. Drops the client on a
    /// closed connection so the next call dials again.
    fn with_client<T>(
        &self,
        f: impl FnOnce(&mut postgres::Client) -> Result<T, postgres::Error>,
    ) -> Result<T, Error> {
        let mut slot = self.client.lock();
        if slot.as_ref().map(postgres::Client::is_closed).unwrap_or(true) {
            *slot = Some(self.config.connect(NoTls).map_err(db_err)?);
        }
        let client = slot.as_mut().expect("client populated above");
        let result = f(client);
        if client.is_closed() {
            *slot = None;
        }
        result.map_err(db_err)
    }

    /// Liveness probe (`SELECT 1`).
    pub fn check(&self) -> Result<(), Error> {
        self.with_client(|c| c.batch_execute("select 1"))
    }

    /// Drops the connection. Later operations would reconnect.
    pub fn close(&self) {
        self.client.lock().take();
    }

    pub fn insert_recording(&self, r: &RecordingToInsert) -> Result<(), Error> {
        self.with_client(|c| {
            c.execute(
                INSERT_RECORDING_SQL,
                &[&r.stream_id, &r.filename, &r.filepath, &r.recorded_at],
            )
            .map(|_| ())
        })
    }

    pub fn upsert_stream(&self, s: &StreamUpsert) -> Result<(), Error> {
        self.with_client(|c| {
            c.execute(
                UPSERT_STREAM_SQL,
                &[
                    &s.stream_id,
                    &s.name,
                    &s.source_type,
                    &s.source_url,
                    &s.ready,
                    &s.bytes_received,
                    &s.bytes_sent,
                ],
            )
            .map(|_| ())
        })
    }

    /// Marks previously-ready streams absent from `active` as offline.
    /// An empty slice marks every ready stream offline (shutdown).
    pub fn mark_streams_offline(&self, active: &[String]) -> Result<(), Error> {
        self.with_client(|c| {
            if active.is_empty() {
                c.execute(MARK_ALL_STREAMS_OFFLINE_SQL, &[]).map(|_| ())
            } else {
                c.execute(MARK_STREAMS_OFFLINE_SQL, &[&active]).map(|_| ())
            }
        })
    }

    /// Fetches per-stream detector overrides, if any. The table is optional;
    /// callers treat any error as "no overrides".
    pub fn detector_config(&self, stream_id: &str) -> Result<Option<DetectorConfigRow>, Error> {
        let row = self.with_client(|c| c.query_opt(DETECTOR_CONFIG_SQL, &[&stream_id]))?;
        Ok(row.map(|row| {
            let corners: [Option<i32>; 4] =
                [row.get(1), row.get(2), row.get(3), row.get(4)];
            DetectorConfigRow {
                enabled: row.get(0),
                crop: match corners {
                    [Some(x1), Some(y1), Some(x2), Some(y2)] => Some((x1, y1, x2, y2)),
                    _ => None,
                },
                sensitivity: row.get(5),
            }
        }))
    }

    /// Recordings lacking an analysis row, ordered by stream then record
    /// time. Running this after a full drain returns nothing, which is what
    /// makes re-running the analyser a no-op.
    pub fn list_pending(&self) -> Result<Vec<PendingRecording>, Error> {
        let rows = self.with_client(|c| c.query(LIST_PENDING_SQL, &[]))?;
        Ok(rows
            .into_iter()
            .map(|row| PendingRecording {
                id: row.get(0),
                stream_id: row.get(1),
                filename: row.get(2),
                filepath: row.get(3),
            })
            .collect())
    }

    pub fn insert_analysis(&self, a: &AnalysisToInsert) -> Result<(), Error> {
        let params: [&(dyn ToSql + Sync); 7] = [
            &a.recording_id,
            &a.description,
            &a.danger,
            &a.danger_level,
            &a.danger_details,
            &a.raw_response,
            &a.error,
        ];
        self.with_client(|c| c.execute(INSERT_ANALYSIS_SQL, &params).map(|_| ()))
    }
}
