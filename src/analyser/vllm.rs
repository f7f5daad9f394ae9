// This file is part of Argus, a motion-triggered camera recording pipeline.
// Copyright (C) 2025 The Argus Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client for the OpenAI-compatible vision inference endpoint.

use base::clock::Clocks;
use base::{err, Error};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Video models chew on a clip for a while; don't give up early.
const INFERENCE_TIMEOUT: Duration = Duration::from_secs(300);
const READY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(500);
const RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Instructions sent with every clip. The field set matches the `analysis`
/// table; anything outside this JSON object is stripped by the scheduler.
const ANALYSIS_PROMPT: &str = "\
Analyze this video segment of a security camera.\n\
Provide a structured analysis in JSON format.\n\
The JSON object must strictly adhere to this schema:\n\
{\n\
    \"description\": \"A detailed description of the scene and events\",\n\
    \"danger\": boolean, // true if there is any danger, threat, or suspicious activity that may require attention\n\
    \"danger_level\": number, // the level of the danger between 0 and 10\n\
    \"danger_details\": \"Details about the danger if any, otherwise empty string\"\n\
}\n\
\n\
Ensure valid JSON output. Do not include any text outside the JSON object.";

/// Terminal result of one dispatch, after retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InferenceOutcome {
    /// 2xx; the model's message content, fencing and all.
    Content(String),
    /// Non-2xx that survived the retry policy.
    HttpError(u16),
}

/// Dispatches one recording to the inference endpoint. This is a trait for
/// test injection.
pub trait InferenceClient: Send + Sync {
    /// Cheap readiness probe of the endpoint's model list.
    fn ready(&self) -> Result<(), Error>;

    /// Asks the model to analyse the clip at `video_url`. `Err` is reserved
    /// for transport/shape problems; HTTP-level failure is an outcome.
    fn analyse(&self, video_url: &str) -> Result<InferenceOutcome, Error>;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct VllmClient<C: Clocks> {
    clocks: C,
    http: reqwest::blocking::Client,
    chat_url: Url,
    models_url: String,
    model: String,
}

/// The models list lives next to the chat endpoint.
fn models_url_for(chat_url: &Url) -> String {
    chat_url
        .as_str()
        .replace("/v1/chat/completions", "/v1/models")
}

impl<C: Clocks> VllmClient<C> {
    pub fn new(clocks: C, chat_url: Url, model: String) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(INFERENCE_TIMEOUT)
            .build()
            .map_err(|e| err!(Internal, msg("unable to build inference client"), source(e)))?;
        Ok(VllmClient {
            clocks,
            models_url: models_url_for(&chat_url),
            chat_url,
            model,
            http,
        })
    }

    fn payload(&self, video_url: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": ANALYSIS_PROMPT},
                    {"type": "video_url", "video_url": {"url": video_url}},
                ],
            }],
            "max_tokens": 2048,
            "temperature": 0.1,
        })
    }
}

impl<C: Clocks> InferenceClient for VllmClient<C> {
    fn ready(&self) -> Result<(), Error> {
        let response = self
            .http
            .get(&self.models_url)
            .timeout(READY_TIMEOUT)
            .send()
            .map_err(|e| err!(Unavailable, msg("inference endpoint unreachable"), source(e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(err!(
                Unavailable,
                msg("inference endpoint returned {}", response.status())
            ))
        }
    }

    fn analyse(&self, video_url: &str) -> Result<InferenceOutcome, Error> {
        let payload = self.payload(video_url);
        let mut backoff = RETRY_BASE_BACKOFF;
        for attempt in 1..=RETRY_ATTEMPTS {
            let response = self
                .http
                .post(self.chat_url.clone())
                .json(&payload)
                .send()
                .map_err(|e| err!(Unavailable, msg("inference request failed"), source(e)))?;
            let status = response.status();
            if status.is_success() {
                let parsed: ChatResponse = response.json().map_err(|e| {
                    err!(Internal, msg("malformed inference response"), source(e))
                })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| err!(Internal, msg("inference response had no choices")))?;
                return Ok(InferenceOutcome::Content(content));
            }
            if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt < RETRY_ATTEMPTS {
                warn!(
                    "inference returned {status}, retrying (attempt {attempt}/{RETRY_ATTEMPTS})"
                );
                self.clocks.sleep(backoff);
                backoff *= 2;
                continue;
            }
            return Ok(InferenceOutcome::HttpError(status.as_u16()));
        }
        unreachable!("loop always returns on the final attempt");
    }
}
