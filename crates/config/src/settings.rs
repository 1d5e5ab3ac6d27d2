//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub audio: AudioSettings,

    #[serde(default)]
    pub vad: VadSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub response: ResponseSettings,
}

/// Audio format settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Sample rate in Hz for the whole pipeline
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frame size in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_frame_ms() -> u32 {
    20
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
        }
    }
}

/// Voice activity gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Probability at or above which a frame counts as speech
    #[serde(default = "default_speech_on")]
    pub speech_on_prob: f32,

    /// Probability below which a frame counts as silence
    #[serde(default = "default_speech_off")]
    pub speech_off_prob: f32,

    /// Sustained speech required before a segment opens (hangover-in)
    #[serde(default = "default_hangover_in")]
    pub hangover_in_ms: u32,

    /// Sustained silence required before a segment closes (hangover-out)
    #[serde(default = "default_hangover_out")]
    pub hangover_out_ms: u32,

    /// RMS energy above which a frame counts as speech while the VAD
    /// capability is unavailable
    #[serde(default = "default_degraded_energy_db")]
    pub degraded_energy_db: f32,
}

fn default_speech_on() -> f32 {
    0.5
}

fn default_speech_off() -> f32 {
    0.35
}

fn default_hangover_in() -> u32 {
    300
}

fn default_hangover_out() -> u32 {
    500
}

fn default_degraded_energy_db() -> f32 {
    -45.0
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            speech_on_prob: default_speech_on(),
            speech_off_prob: default_speech_off(),
            hangover_in_ms: default_hangover_in(),
            hangover_out_ms: default_hangover_out(),
            degraded_energy_db: default_degraded_energy_db(),
        }
    }
}

/// Frame bus buffer bounds, per stage edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Transport → gate
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,

    /// Gate → transcription
    #[serde(default = "default_gated_capacity")]
    pub gated_capacity: usize,

    /// Dialogue → synthesis
    #[serde(default = "default_synth_capacity")]
    pub synth_capacity: usize,

    /// Synthesis → playout
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_inbound_capacity() -> usize {
    64
}

fn default_gated_capacity() -> usize {
    64
}

fn default_synth_capacity() -> usize {
    32
}

fn default_outbound_capacity() -> usize {
    64
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: default_inbound_capacity(),
            gated_capacity: default_gated_capacity(),
            synth_capacity: default_synth_capacity(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

/// Response generation and synthesis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSettings {
    /// How many chunks synthesis may run ahead of playback
    #[serde(default = "default_chunk_ahead")]
    pub chunk_ahead: usize,

    /// Spoken when the language model fails
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,

    /// System prompt for the language model
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Speak an opening line when a participant joins
    #[serde(default)]
    pub greet_on_join: bool,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_chunk_ahead() -> usize {
    2
}

fn default_fallback_text() -> String {
    "I'm sorry, I'm having trouble responding right now. Could you say that again?".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful and friendly assistant. Keep your responses concise and natural \
     for voice conversation. Respond in a conversational, friendly tone."
        .to_string()
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            chunk_ahead: default_chunk_ahead(),
            fallback_text: default_fallback_text(),
            system_prompt: default_system_prompt(),
            greet_on_join: false,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus `VOXLOOP_*` environment
    /// variables, layered over defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(false));
        } else {
            builder = builder.add_source(File::with_name("voxloop").required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("VOXLOOP")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        tracing::debug!(path = ?config_path, "configuration loaded");
        Ok(settings)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.vad.speech_on_prob)
            || !(0.0..=1.0).contains(&self.vad.speech_off_prob)
        {
            return Err(ConfigError::Invalid(
                "vad probabilities must be within [0.0, 1.0]".to_string(),
            ));
        }
        if self.vad.speech_off_prob > self.vad.speech_on_prob {
            return Err(ConfigError::Invalid(format!(
                "speech_off_prob ({}) must not exceed speech_on_prob ({})",
                self.vad.speech_off_prob, self.vad.speech_on_prob
            )));
        }
        if self.vad.degraded_energy_db > 0.0 {
            return Err(ConfigError::Invalid(
                "degraded_energy_db must not exceed 0 dBFS".to_string(),
            ));
        }
        if self.audio.frame_ms == 0 {
            return Err(ConfigError::Invalid("frame_ms must be positive".to_string()));
        }
        if self.response.chunk_ahead == 0 {
            return Err(ConfigError::Invalid(
                "chunk_ahead must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
