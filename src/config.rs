use std::sync::LazyLock;

/// Process configuration, read from the environment once at startup.
pub struct BridgeConfig {
    bind_addr: String,
    media_root: String,
    ffmpeg: String,
    port_min: u16,
    port_max: u16,
}

impl BridgeConfig {
    fn from_env() -> Self {
        Self {
            bind_addr: env_or("RESTREAM_BIND", "0.0.0.0:3000"),
            media_root: env_or("RESTREAM_MEDIA_ROOT", "media"),
            ffmpeg: env_or("RESTREAM_FFMPEG", "ffmpeg"),
            port_min: env_parse("RESTREAM_PORT_MIN", 50000),
            port_max: env_parse("RESTREAM_PORT_MAX", 50998),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn media_root(&self) -> &str {
        &self.media_root
    }

    pub fn ffmpeg(&self) -> &str {
        &self.ffmpeg
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.port_min, self.port_max)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn config() -> &'static BridgeConfig {
    static CONFIG: LazyLock<BridgeConfig> = LazyLock::new(BridgeConfig::from_env);
    &CONFIG
}
