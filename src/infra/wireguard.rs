//! WireGuard keys and client configuration

use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::core::Sensitive;
use crate::infra::topology::Cidr;
use crate::infra::InfraError;

pub struct WgKeypair {
    pub private: Sensitive,
    pub public: String,
}

/// Generates WireGuard keypairs
#[async_trait]
pub trait WgKeySource: Send + Sync {
    async fn generate(&self) -> Result<WgKeypair, InfraError>;
}

/// WgKeySource backed by the wg binary
pub struct WgTool;

#[async_trait]
impl WgKeySource for WgTool {
    async fn generate(&self) -> Result<WgKeypair, InfraError> {
        let output = Command::new("wg")
            .arg("genkey")
            .output()
            .await
            .map_err(|e| InfraError::Provider {
                operation: "wg genkey".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(InfraError::Provider {
                operation: "wg genkey".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let private = Sensitive::new(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        );

        let mut child = Command::new("wg")
            .arg("pubkey")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InfraError::Provider {
                operation: "wg pubkey".to_string(),
                message: e.to_string(),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(private.expose().as_bytes())
                .await
                .map_err(|e| InfraError::Provider {
                    operation: "wg pubkey".to_string(),
                    message: e.to_string(),
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| InfraError::Provider {
                operation: "wg pubkey".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(InfraError::Provider {
                operation: "wg pubkey".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(WgKeypair {
            private,
            public: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        })
    }
}

/// Gateway-side WireGuard configuration, delivered through instance
/// user data so the tunnel comes up on first boot
pub struct ServerConfig {
    pub address: Ipv4Addr,
    pub address_prefix: u8,
    pub private_key: Sensitive,
    pub listen_port: u16,
    pub client_public_key: String,
    pub client_ip: Ipv4Addr,
}

impl ServerConfig {
    pub fn render(&self) -> String {
        format!(
            "[Interface]\n\
             Address = {}/{}\n\
             ListenPort = {}\n\
             PrivateKey = {}\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = {}/32\n",
            self.address,
            self.address_prefix,
            self.listen_port,
            self.private_key.expose(),
            self.client_public_key,
            self.client_ip,
        )
    }

    /// Boot script for instance user data: enables forwarding, writes
    /// the config owner-readable, brings the tunnel up
    pub fn user_data(&self) -> String {
        format!(
            "#!/bin/bash\n\
             set -e\n\
             sysctl -w net.ipv4.ip_forward=1\n\
             mkdir -p /etc/wireguard\n\
             umask 077\n\
             cat > /etc/wireguard/wg0.conf <<'WGEOF'\n\
             {}WGEOF\n\
             systemctl enable --now wg-quick@wg0\n",
            self.render()
        )
    }
}

/// Operator-side WireGuard tunnel configuration
pub struct ClientConfig {
    pub address: Ipv4Addr,
    pub address_prefix: u8,
    pub private_key: Sensitive,
    pub server_public_key: String,
    pub endpoint: String,
    pub allowed_ips: Vec<Cidr>,
}

impl ClientConfig {
    /// Every network the tunnel must carry has to fall inside some
    /// AllowedIPs entry, or traffic for it silently bypasses the tunnel
    pub fn validate_allowed_ips(&self, required: &[Cidr]) -> Result<(), InfraError> {
        for network in required {
            let covered = self
                .allowed_ips
                .iter()
                .any(|allowed| allowed.contains_cidr(network));
            if !covered {
                return Err(InfraError::Other(anyhow::anyhow!(
                    "AllowedIPs does not cover required network {network}"
                )));
            }
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let allowed = self
            .allowed_ips
            .iter()
            .map(Cidr::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "[Interface]\n\
             Address = {}/{}\n\
             PrivateKey = {}\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             Endpoint = {}\n\
             AllowedIPs = {}\n\
             PersistentKeepalive = 25\n",
            self.address,
            self.address_prefix,
            self.private_key.expose(),
            self.server_public_key,
            self.endpoint,
            allowed,
        )
    }

    /// Write the config readable only by the owner
    pub fn write(&self, path: &Path) -> Result<(), InfraError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InfraError::Other(e.into()))?;
        }
        std::fs::write(path, self.render()).map_err(|e| InfraError::Other(e.into()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| InfraError::Other(e.into()))?;
        }

        info!(path = %path.display(), "WireGuard client config written");
        Ok(())
    }
}
