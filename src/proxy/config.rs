//! Runtime configuration handed to the proxy process
//!
//! A [`RuntimeConfig`] pairs one local SOCKS inbound with the outbound built
//! from a [`ConnectionDescriptor`]. It only ever lives on disk inside a
//! [`TransientConfig`], which deletes the file when dropped.

use crate::error::EngineError;
use crate::proxy::models::{ConnectionDescriptor, Scheme, TransportOptions};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Address the local inbound listens on
pub const LOOPBACK: &str = "127.0.0.1";

/// Prefix of every transient config file name
pub const CONFIG_FILE_PREFIX: &str = "link-probe-";

#[derive(Debug, Clone, Serialize)]
struct LogSettings {
    loglevel: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct SocksSettings {
    auth: &'static str,
    udp: bool,
}

/// Local SOCKS listener without authentication and with UDP relay
#[derive(Debug, Clone, Serialize)]
pub struct Inbound {
    port: u16,
    listen: &'static str,
    protocol: &'static str,
    settings: SocksSettings,
}

impl Inbound {
    pub fn socks(port: u16) -> Self {
        Self {
            port,
            listen: LOOPBACK,
            protocol: "socks",
            settings: SocksSettings {
                auth: "noauth",
                udp: true,
            },
        }
    }
}

/// Complete configuration for one proxy process
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    log: LogSettings,
    inbounds: Vec<Inbound>,
    outbounds: Vec<Value>,
}

impl RuntimeConfig {
    pub fn new(local_port: u16, descriptor: &ConnectionDescriptor) -> Self {
        Self {
            log: LogSettings { loglevel: "warning" },
            inbounds: vec![Inbound::socks(local_port)],
            outbounds: vec![outbound(descriptor)],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

/// Build the outbound object for a descriptor
pub fn outbound(descriptor: &ConnectionDescriptor) -> Value {
    match descriptor.scheme {
        Scheme::Vless => json!({
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": descriptor.address,
                    "port": descriptor.port,
                    "users": [{
                        "id": descriptor.credential_id,
                        "encryption": descriptor.encryption,
                    }],
                }],
            },
            "streamSettings": stream_settings(&descriptor.transport),
        }),
    }
}

fn stream_settings(transport: &TransportOptions) -> Value {
    let mut settings = json!({
        "network": transport.network,
        "security": transport.security,
    });

    if let Some(http) = &transport.http {
        let host: Vec<&str> = http.host.as_deref().into_iter().collect();
        settings["tcpSettings"] = json!({
            "header": {
                "type": "http",
                "request": {
                    "version": http.version,
                    "method": http.method,
                    "path": [http.path],
                    "headers": {
                        "Host": host,
                        "User-Agent": ["Mozilla/5.0"],
                        "Accept-Encoding": ["gzip, deflate"],
                        "Connection": ["keep-alive"],
                        "Pragma": "no-cache",
                    },
                },
            },
        });
    }

    settings
}

/// A runtime config written to disk, removed when dropped
#[derive(Debug)]
pub struct TransientConfig {
    path: PathBuf,
}

impl TransientConfig {
    /// Serialize `config` into a uniquely named file under `dir`
    pub fn write(dir: &Path, config: &RuntimeConfig) -> Result<Self, EngineError> {
        let bytes = config.to_json()?;
        let guard = Self {
            path: dir.join(format!("{}{}.json", CONFIG_FILE_PREFIX, Uuid::new_v4())),
        };

        fs::write(&guard.path, bytes).map_err(|source| EngineError::ConfigWrite {
            path: guard.path.clone(),
            source,
        })?;
        debug!("Wrote runtime config to {:?}", guard.path);

        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientConfig {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed runtime config {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove runtime config {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::parser::LinkParser;

    fn descriptor(link: &str) -> ConnectionDescriptor {
        LinkParser::parse(link).unwrap()
    }

    #[test]
    fn test_runtime_config_layout() {
        let d = descriptor("vless://abc-123@example.com:443?encryption=none&security=tls&type=tcp");
        let config = RuntimeConfig::new(10809, &d);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value["inbounds"],
            json!([{
                "port": 10809,
                "listen": "127.0.0.1",
                "protocol": "socks",
                "settings": {"auth": "noauth", "udp": true},
            }])
        );

        let outbound = &value["outbounds"][0];
        assert_eq!(outbound["protocol"], "vless");
        let vnext = &outbound["settings"]["vnext"][0];
        assert_eq!(vnext["address"], "example.com");
        assert_eq!(vnext["port"], 443);
        assert_eq!(vnext["users"][0]["id"], "abc-123");
        assert_eq!(vnext["users"][0]["encryption"], "none");
        assert_eq!(outbound["streamSettings"], json!({"network": "tcp", "security": "tls"}));
    }

    #[test]
    fn test_http_header_settings() {
        let d = descriptor("vless://abc@example.com:80?type=tcp&headerType=http&host=cdn.example.com");
        let value = outbound(&d);
        let request = &value["streamSettings"]["tcpSettings"]["header"]["request"];
        assert_eq!(value["streamSettings"]["tcpSettings"]["header"]["type"], "http");
        assert_eq!(request["method"], "GET");
        assert_eq!(request["path"], json!(["/"]));
        assert_eq!(request["headers"]["Host"], json!(["cdn.example.com"]));
        assert_eq!(request["headers"]["Pragma"], "no-cache");
    }

    #[test]
    fn test_http_header_without_host() {
        let d = descriptor("vless://abc@example.com:80?headerType=http");
        let value = outbound(&d);
        let headers = &value["streamSettings"]["tcpSettings"]["header"]["request"]["headers"];
        assert_eq!(headers["Host"], json!([]));
    }

    #[test]
    fn test_transient_config_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let d = descriptor("vless://abc@example.com:443");
        let config = RuntimeConfig::new(20000, &d);

        let file = TransientConfig::write(dir.path(), &config).unwrap();
        let path = file.path().to_path_buf();
        let written: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["inbounds"][0]["port"], 20000);

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_transient_config_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::new(20000, &descriptor("vless://abc@example.com:443"));
        let a = TransientConfig::write(dir.path(), &config).unwrap();
        let b = TransientConfig::write(dir.path(), &config).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_transient_config_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let config = RuntimeConfig::new(20000, &descriptor("vless://abc@example.com:443"));
        let err = TransientConfig::write(&missing, &config).unwrap_err();
        assert!(matches!(err, EngineError::ConfigWrite { .. }));
    }
}
