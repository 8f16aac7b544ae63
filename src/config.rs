use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub user: UserConfig,
    pub channels: Vec<String>,
    pub prefix: String,
    /// Probes started per second.
    pub rate: f64,
    /// Per-probe timeout in milliseconds.
    pub timeout: u64,
    /// Server name → address to dial instead.
    pub override_host: HashMap<String, String>,
    pub data_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub nick: String,
    pub ident: String,
    pub gecos: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oper: Option<OperConfig>,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct OperConfig {
    pub name: String,
    pub password: String,
}

impl std::fmt::Debug for OperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperConfig")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 6697,
                secure: true,
            },
            user: UserConfig {
                nick: "CertServ".into(),
                ident: "certserv".into(),
                gecos: "Certificate expiry monitor".into(),
                oper: None,
            },
            channels: Vec::new(),
            prefix: "!".into(),
            rate: 1.0,
            timeout: 5000,
            override_host: HashMap::new(),
            data_file: "data.json".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("certserv.toml"))
            .merge(Json::file("certserv.json"))
            .merge(Env::prefixed("CERTSERV_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("CERTSERV_OPER_PASSWORD_FILE") {
            let password = std::fs::read_to_string(secret_file)?.trim().to_string();
            match config.user.oper.as_mut() {
                Some(oper) => oper.password = password,
                None => anyhow::bail!("CERTSERV_OPER_PASSWORD_FILE set without an oper name"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            anyhow::bail!("Invalid rate {}: must be a positive number", self.rate);
        }
        // The tick period must be representable and non-zero.
        match Duration::try_from_secs_f64(1.0 / self.rate) {
            Ok(period) if !period.is_zero() => {}
            _ => anyhow::bail!("Invalid rate {}: out of range", self.rate),
        }
        if self.timeout == 0 {
            anyhow::bail!("Invalid timeout: must be at least 1ms");
        }
        if self.user.nick.is_empty() {
            anyhow::bail!("Invalid nick: must not be empty");
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Address to dial for `server`.
    pub fn dial_addr<'a>(&'a self, server: &'a str) -> &'a str {
        self.override_host
            .get(server)
            .map(String::as_str)
            .unwrap_or(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_rate() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = Config {
                rate,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "rate {} accepted", rate);
        }
    }

    #[test]
    fn rejects_rate_without_usable_period() {
        for rate in [1e10, 1e-300] {
            let config = Config {
                rate,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "rate {} accepted", rate);
        }
        let config = Config {
            rate: 1000.0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn override_host_changes_dial_addr() {
        let mut config = Config::default();
        config
            .override_host
            .insert("a.example".into(), "192.0.2.7".into());
        assert_eq!(config.dial_addr("a.example"), "192.0.2.7");
        assert_eq!(config.dial_addr("b.example"), "b.example");
    }

    #[test]
    fn nested_values_from_figment() {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Json::string(
                r#"{"rate": 4, "server": {"host": "irc.example", "port": 6697, "secure": true}, "override_host": {"a": "b"}}"#,
            ))
            .extract()
            .unwrap();
        assert_eq!(config.rate, 4.0);
        assert_eq!(config.server.host, "irc.example");
        assert_eq!(config.dial_addr("a"), "b");
        assert_eq!(config.prefix, "!");
    }
}
