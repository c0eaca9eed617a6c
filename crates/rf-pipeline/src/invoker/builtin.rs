//! Stand-in stage functions for running the pipeline without external
//! services.
//!
//! They produce the same artifacts, under the same names, as the real stages
//! (`script.txt`, `edl.json`, `voice.wav`), but the content is placeholder:
//! a templated script, a silent voice track and a single default clip.

use std::sync::Arc;

use async_trait::async_trait;
use rf_core::{Action, ObjectRef, ResourceKind, StageError, StageName};
use serde_json::json;

use super::local::{LocalFunctionInvoker, StageContext, StageFunction};
use crate::stage::{PUBLISH_CHANNEL, SCRIPT_MODEL, SPEECH_ENDPOINT};

const DEFAULT_TOPIC: &str = "Global diversification basics";
const DEFAULT_CLIP: &str = "assets/default_clip.mp4";
const SAMPLE_RATE: u32 = 22_050;
const WORDS_PER_SECOND: f64 = 2.5;
const MAX_VOICE_SECS: u32 = 600;

/// Register every stand-in on `invoker`.
pub fn register_all(invoker: LocalFunctionInvoker) -> LocalFunctionInvoker {
    invoker
        .register(StageName::Script, Arc::new(PlaceholderScript))
        .register(StageName::Tts, Arc::new(SilentVoice))
        .register(StageName::Broll, Arc::new(DefaultClip))
        .register(StageName::Upload, Arc::new(PublishCheck))
}

/// Writes a templated script for the payload's `topic` and an empty EDL.
pub struct PlaceholderScript;

#[async_trait]
impl StageFunction for PlaceholderScript {
    async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError> {
        ctx.authorize(
            ResourceKind::InferenceModel,
            &format!("{}/{SCRIPT_MODEL}", ctx.region),
            Action::Invoke,
        )?;

        let topic = ctx.payload_str("topic").unwrap_or(DEFAULT_TOPIC);
        let script = format!(
            "{topic}.\n\n\
             Today we look at {topic} in plain language. \
             First, what it is. Second, how it works in practice. \
             Third, what to watch out for. \
             Rules differ between countries, so check what applies where you live. \
             Not financial advice.\n"
        );
        let script_ref = ctx.put("script.txt", script.into_bytes()).await?;

        let edl = json!({
            "fps": 30,
            "audio": ctx.object("voice.wav").key,
            "tracks": [],
        });
        let edl_ref = ctx.put("edl.json", edl.to_string().into_bytes()).await?;

        Ok(vec![script_ref, edl_ref])
    }
}

/// Writes a silent mono WAV whose length follows the script's word count.
pub struct SilentVoice;

#[async_trait]
impl StageFunction for SilentVoice {
    async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError> {
        ctx.authorize(
            ResourceKind::SpeechSynthesis,
            &format!("{}/{SPEECH_ENDPOINT}", ctx.region),
            Action::Invoke,
        )?;

        let script = ctx.get("script.txt").await?;
        let words = String::from_utf8_lossy(&script).split_whitespace().count();
        let secs = ((words as f64 / WORDS_PER_SECOND).ceil() as u32).clamp(1, MAX_VOICE_SECS);

        let voice = ctx.put("voice.wav", silent_wav(secs)).await?;
        Ok(vec![voice])
    }
}

/// Fills the EDL with one default clip.
pub struct DefaultClip;

#[async_trait]
impl StageFunction for DefaultClip {
    async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError> {
        let raw = ctx.get("edl.json").await?;
        let mut edl: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| StageError::execution(format!("edl.json is not valid JSON: {e}")))?;
        edl["tracks"] = json!([{ "t": 0.0, "dur": 30.0, "src": DEFAULT_CLIP }]);

        let edl_ref = ctx.put("edl.json", edl.to_string().into_bytes()).await?;
        Ok(vec![edl_ref])
    }
}

/// Confirms the rendered video is present and reports it as published.
pub struct PublishCheck;

#[async_trait]
impl StageFunction for PublishCheck {
    async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError> {
        ctx.authorize(ResourceKind::VideoPlatform, PUBLISH_CHANNEL, Action::Invoke)?;

        let video = ctx.object("out.mp4");
        if !ctx.store.exists(&video).await? {
            return Err(StageError::execution(format!("{video} not found")));
        }
        tracing::info!(job_id = %ctx.job_id, video = %video, "Publish step skipped; video ready");
        Ok(vec![video])
    }
}

/// 16-bit mono PCM WAV of `secs` seconds of silence.
fn silent_wav(secs: u32) -> Vec<u8> {
    let data_len = SAMPLE_RATE * 2 * secs;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}
