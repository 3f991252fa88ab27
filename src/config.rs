use std::collections::HashMap;
use std::fs;

use log::{debug, info};

/// LM Studio API configuration, loaded from lmapiconf.txt
#[derive(Debug, Clone)]
pub struct LMConfig {
    pub base_url: String,
    pub timeout: u64,
    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: i32,
    /// Manual capacity override; skips probing entirely when both are set
    pub context_tokens_override: Option<usize>,
    pub max_output_tokens_override: Option<usize>,
    pub delivery_max_retries: u32,
    pub delivery_backoff_ms: u64,
    /// External TTS command (gtts-cli style); audio rendering is disabled when unset
    pub tts_command: Option<String>,
    pub subscriptions_file: String,
    pub watch_interval_secs: u64,
}

const CONFIG_PATHS: [&str; 4] = [
    "lmapiconf.txt",
    "../lmapiconf.txt",
    "../../lmapiconf.txt",
    "src/lmapiconf.txt",
];

const REQUIRED_KEYS: [&str; 5] = [
    "LM_STUDIO_BASE_URL",
    "LM_STUDIO_TIMEOUT",
    "DEFAULT_MODEL",
    "DEFAULT_TEMPERATURE",
    "DEFAULT_MAX_TOKENS",
];

/// Parse KEY=VALUE lines, skipping comments and blank lines
pub fn parse_config_map(content: &str) -> HashMap<String, String> {
    // Remove BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut config_map = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(equals_pos) = line.find('=') {
            let key = line[..equals_pos].trim().to_string();
            let value = line[equals_pos + 1..].trim().to_string();
            config_map.insert(key, value);
        }
    }

    config_map
}

impl LMConfig {
    pub fn from_map(
        config_map: &HashMap<String, String>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        for key in &REQUIRED_KEYS {
            if !config_map.contains_key(*key) {
                return Err(format!("Required setting '{}' not found in lmapiconf.txt", key).into());
            }
        }

        let parse_opt_usize = |key: &str| -> Result<Option<usize>, String> {
            match config_map.get(key) {
                Some(v) => v
                    .parse()
                    .map(Some)
                    .map_err(|_| format!("Invalid {} value in lmapiconf.txt", key)),
                None => Ok(None),
            }
        };

        let config = LMConfig {
            base_url: config_map
                .get("LM_STUDIO_BASE_URL")
                .ok_or("LM_STUDIO_BASE_URL not found")?
                .trim_end_matches('/')
                .to_string(),
            timeout: config_map
                .get("LM_STUDIO_TIMEOUT")
                .ok_or("LM_STUDIO_TIMEOUT not found")?
                .parse()
                .map_err(|_| "Invalid LM_STUDIO_TIMEOUT value in lmapiconf.txt")?,
            default_model: config_map
                .get("DEFAULT_MODEL")
                .ok_or("DEFAULT_MODEL not found")?
                .clone(),
            default_temperature: config_map
                .get("DEFAULT_TEMPERATURE")
                .ok_or("DEFAULT_TEMPERATURE not found")?
                .parse()
                .map_err(|_| "Invalid DEFAULT_TEMPERATURE value in lmapiconf.txt")?,
            default_max_tokens: config_map
                .get("DEFAULT_MAX_TOKENS")
                .ok_or("DEFAULT_MAX_TOKENS not found")?
                .parse()
                .map_err(|_| "Invalid DEFAULT_MAX_TOKENS value in lmapiconf.txt")?,
            context_tokens_override: parse_opt_usize("CONTEXT_TOKENS_OVERRIDE")?,
            max_output_tokens_override: parse_opt_usize("MAX_OUTPUT_TOKENS_OVERRIDE")?,
            delivery_max_retries: config_map
                .get("DELIVERY_MAX_RETRIES")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| "Invalid DELIVERY_MAX_RETRIES value in lmapiconf.txt")?
                .unwrap_or(3),
            delivery_backoff_ms: config_map
                .get("DELIVERY_BACKOFF_MS")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| "Invalid DELIVERY_BACKOFF_MS value in lmapiconf.txt")?
                .unwrap_or(2000),
            tts_command: config_map.get("TTS_COMMAND").cloned().filter(|c| !c.is_empty()),
            subscriptions_file: config_map
                .get("SUBSCRIPTIONS_FILE")
                .cloned()
                .unwrap_or_else(|| "subscriptions.json".to_string()),
            watch_interval_secs: config_map
                .get("WATCH_INTERVAL_SECS")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| "Invalid WATCH_INTERVAL_SECS value in lmapiconf.txt")?
                .unwrap_or(900),
        };

        Ok(config)
    }
}

/// Load LM Studio configuration from file using multi-path fallback
pub fn load_lm_config() -> Result<LMConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut content = String::new();
    let mut found_file = false;
    let mut config_source = "";

    for config_path in &CONFIG_PATHS {
        match fs::read_to_string(config_path) {
            Ok(file_content) => {
                content = file_content;
                found_file = true;
                config_source = config_path;
                debug!("🔧 Loaded config from {}", config_path);
                break;
            }
            Err(_) => continue,
        }
    }

    if !found_file {
        return Err(
            "lmapiconf.txt file not found in any expected location (., .., ../.., src/)".into(),
        );
    }

    let config_map = parse_config_map(&content);
    let config = LMConfig::from_map(&config_map)?;

    info!("✅ Configuration loaded successfully from {}", config_source);
    Ok(config)
}
