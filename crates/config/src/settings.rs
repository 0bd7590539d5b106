//! Main settings module

use crate::ConfigError;
use call_engine_pipeline::{BargeInConfig, PacerConfig, TurnConfig, VadConfig};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Engine-level settings not owned by any one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum concurrent calls accepted before `on_call_start` rejects.
    pub max_calls: usize,
    /// Conversation turns retained per call.
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_calls: 64,
            history_limit: 30,
        }
    }
}

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub vad: VadConfig,
    pub pacer: PacerConfig,
    pub barge_in: BargeInConfig,
    pub turn: TurnConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_engine()?;
        self.validate_vad()?;
        self.validate_pacer()?;
        self.validate_barge_in()?;
        Ok(())
    }

    fn validate_engine(&self) -> Result<(), ConfigError> {
        if self.engine.max_calls == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_calls".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.engine.history_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.history_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn validate_vad(&self) -> Result<(), ConfigError> {
        if self.vad.min_open_frames == 0 {
            return Err(ConfigError::InvalidValue {
                field: "vad.min_open_frames".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.vad.abs_rms_close > self.vad.abs_rms_open {
            return Err(ConfigError::InvalidValue {
                field: "vad.abs_rms_close".to_string(),
                message: "close threshold must not exceed open threshold".to_string(),
            });
        }
        if self.vad.snr_close_db > self.vad.snr_open_db {
            return Err(ConfigError::InvalidValue {
                field: "vad.snr_close_db".to_string(),
                message: "close threshold must not exceed open threshold".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.vad.abs_rms_open) {
            return Err(ConfigError::InvalidValue {
                field: "vad.abs_rms_open".to_string(),
                message: "normalized RMS must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }

    fn validate_pacer(&self) -> Result<(), ConfigError> {
        if self.pacer.frame_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pacer.frame_bytes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.pacer.frame_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pacer.frame_interval_ms".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.pacer.backpressure_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pacer.backpressure_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn validate_barge_in(&self) -> Result<(), ConfigError> {
        if self.barge_in.streak_frames == 0 {
            return Err(ConfigError::InvalidValue {
                field: "barge_in.streak_frames".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.barge_in.rms_threshold) || self.barge_in.rms_threshold == 0.0
        {
            return Err(ConfigError::InvalidValue {
                field: "barge_in.rms_threshold".to_string(),
                message: "normalized RMS must be within (0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Load settings from layered sources: `config/default`, an optional
/// environment-specific file, then `CALL_ENGINE_*` variables.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("CALL_ENGINE")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
