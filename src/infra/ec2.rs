//! CloudProvider backed by the aws CLI

use std::net::Ipv4Addr;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::infra::topology::{Cidr, Market};
use crate::infra::{CloudProvider, InfraError, IngressRule, Instance, InstanceRequest, VpcIds};

const MANAGED_TAG: &str = "labforge";

/// Drives `aws ec2` with JSON output. Credentials come from the
/// standard AWS environment/config chain.
pub struct Ec2CliProvider {
    region: String,
}

impl Ec2CliProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }

    async fn run(&self, operation: &str, args: &[&str]) -> Result<Value, InfraError> {
        debug!(operation, ?args, "aws ec2");
        let output = Command::new("aws")
            .args(["ec2", operation, "--region", &self.region, "--output", "json"])
            .args(args)
            .output()
            .await
            .map_err(|e| InfraError::Provider {
                operation: operation.to_string(),
                message: format!("failed to run aws: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("InsufficientInstanceCapacity")
                || stderr.contains("SpotMaxPriceTooLow")
            {
                let instance_type = args
                    .iter()
                    .position(|a| *a == "--instance-type")
                    .and_then(|i| args.get(i + 1))
                    .unwrap_or(&"unknown")
                    .to_string();
                return Err(InfraError::CapacityUnavailable { instance_type });
            }
            return Err(InfraError::Provider {
                operation: operation.to_string(),
                message: stderr,
            });
        }

        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| InfraError::Provider {
            operation: operation.to_string(),
            message: format!("unparseable response: {e}"),
        })
    }

    fn tag_spec(resource_type: &str, name: &str) -> String {
        format!(
            "ResourceType={resource_type},Tags=[{{Key=Name,Value={name}}},{{Key=ManagedBy,Value={MANAGED_TAG}}}]"
        )
    }

    fn field<'a>(value: &'a Value, path: &[&str], operation: &str) -> Result<&'a Value, InfraError> {
        let mut current = value;
        for key in path {
            current = match key.parse::<usize>() {
                Ok(index) => current.get(index),
                Err(_) => current.get(key),
            }
            .ok_or_else(|| InfraError::Provider {
                operation: operation.to_string(),
                message: format!("missing field {} in response", path.join(".")),
            })?;
        }
        Ok(current)
    }

    fn string_field(value: &Value, path: &[&str], operation: &str) -> Result<String, InfraError> {
        Ok(Self::field(value, path, operation)?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl CloudProvider for Ec2CliProvider {
    async fn create_vpc(&self, name: &str, cidr: Cidr) -> Result<VpcIds, InfraError> {
        let cidr = cidr.to_string();
        let tags = Self::tag_spec("vpc", name);
        let value = self
            .run(
                "create-vpc",
                &["--cidr-block", &cidr, "--tag-specifications", &tags],
            )
            .await?;
        let vpc_id = Self::string_field(&value, &["Vpc", "VpcId"], "create-vpc")?;

        // The main route table comes with the VPC; look it up
        let filter = format!("Name=vpc-id,Values={vpc_id}");
        let value = self
            .run("describe-route-tables", &["--filters", &filter])
            .await?;
        let route_table_id = Self::string_field(
            &value,
            &["RouteTables", "0", "RouteTableId"],
            "describe-route-tables",
        )?;

        Ok(VpcIds {
            vpc_id,
            route_table_id,
        })
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), InfraError> {
        self.run("delete-vpc", &["--vpc-id", vpc_id]).await?;
        Ok(())
    }

    async fn create_subnet(&self, vpc_id: &str, cidr: Cidr) -> Result<String, InfraError> {
        let cidr = cidr.to_string();
        let value = self
            .run(
                "create-subnet",
                &["--vpc-id", vpc_id, "--cidr-block", &cidr],
            )
            .await?;
        let subnet_id = Self::string_field(&value, &["Subnet", "SubnetId"], "create-subnet")?;

        // Instances need public addresses for SSH and WireGuard
        self.run(
            "modify-subnet-attribute",
            &["--subnet-id", &subnet_id, "--map-public-ip-on-launch"],
        )
        .await?;

        Ok(subnet_id)
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), InfraError> {
        self.run("delete-subnet", &["--subnet-id", subnet_id])
            .await?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        rules: &[IngressRule],
    ) -> Result<String, InfraError> {
        let value = self
            .run(
                "create-security-group",
                &[
                    "--vpc-id",
                    vpc_id,
                    "--group-name",
                    name,
                    "--description",
                    name,
                ],
            )
            .await?;
        let group_id = Self::string_field(&value, &["GroupId"], "create-security-group")?;

        for rule in rules {
            let mut args = vec![
                "--group-id".to_string(),
                group_id.clone(),
                "--protocol".to_string(),
                rule.protocol.clone(),
                "--cidr".to_string(),
                rule.cidr.clone(),
            ];
            if let Some(port) = rule.port {
                args.push("--port".to_string());
                args.push(port.to_string());
            }
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.run("authorize-security-group-ingress", &arg_refs)
                .await?;
        }

        Ok(group_id)
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), InfraError> {
        self.run("delete-security-group", &["--group-id", group_id])
            .await?;
        Ok(())
    }

    async fn run_instance(&self, request: &InstanceRequest) -> Result<Instance, InfraError> {
        let tags = Self::tag_spec("instance", &request.name);
        let mut args = vec![
            "--image-id".to_string(),
            request.ami.clone(),
            "--instance-type".to_string(),
            request.instance_type.clone(),
            "--key-name".to_string(),
            request.key_name.clone(),
            "--subnet-id".to_string(),
            request.subnet_id.clone(),
            "--security-group-ids".to_string(),
            request.security_group_id.clone(),
            "--tag-specifications".to_string(),
            tags,
        ];
        if let Some(ip) = request.private_ip {
            args.push("--private-ip-address".to_string());
            args.push(ip.to_string());
        }
        if request.market == Market::Spot {
            args.push("--instance-market-options".to_string());
            args.push("MarketType=spot,SpotOptions={SpotInstanceType=one-time}".to_string());
        }
        if let Some(user_data) = &request.user_data {
            args.push("--user-data".to_string());
            args.push(user_data.clone());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let value = self.run("run-instances", &arg_refs).await?;

        let id = Self::string_field(&value, &["Instances", "0", "InstanceId"], "run-instances")?;
        let eni_id = Self::string_field(
            &value,
            &["Instances", "0", "NetworkInterfaces", "0", "NetworkInterfaceId"],
            "run-instances",
        )?;
        let private_ip = Self::string_field(
            &value,
            &["Instances", "0", "PrivateIpAddress"],
            "run-instances",
        )?
        .parse()
        .map_err(|e| InfraError::Provider {
            operation: "run-instances".to_string(),
            message: format!("bad private IP in response: {e}"),
        })?;

        Ok(Instance {
            id,
            eni_id,
            private_ip,
            public_ip: None,
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), InfraError> {
        self.run("terminate-instances", &["--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn instance_running(&self, instance_id: &str) -> Result<bool, InfraError> {
        let value = self
            .run("describe-instances", &["--instance-ids", instance_id])
            .await?;
        let state = Self::string_field(
            &value,
            &["Reservations", "0", "Instances", "0", "State", "Name"],
            "describe-instances",
        )?;
        Ok(state == "running")
    }

    async fn instance_exists(&self, instance_id: &str) -> Result<bool, InfraError> {
        let result = self
            .run("describe-instances", &["--instance-ids", instance_id])
            .await;
        match result {
            Ok(value) => {
                let state = Self::string_field(
                    &value,
                    &["Reservations", "0", "Instances", "0", "State", "Name"],
                    "describe-instances",
                )
                .unwrap_or_default();
                Ok(!matches!(state.as_str(), "terminated" | "shutting-down" | ""))
            }
            Err(InfraError::Provider { message, .. })
                if message.contains("InvalidInstanceID.NotFound") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn public_ip(&self, instance_id: &str) -> Result<Option<Ipv4Addr>, InfraError> {
        let value = self
            .run("describe-instances", &["--instance-ids", instance_id])
            .await?;
        let ip = Self::string_field(
            &value,
            &["Reservations", "0", "Instances", "0", "PublicIpAddress"],
            "describe-instances",
        )
        .unwrap_or_default();
        Ok(ip.parse().ok())
    }

    async fn set_source_dest_check(&self, eni_id: &str, enabled: bool) -> Result<(), InfraError> {
        let flag = if enabled {
            "--source-dest-check"
        } else {
            "--no-source-dest-check"
        };
        self.run(
            "modify-network-interface-attribute",
            &["--network-interface-id", eni_id, flag],
        )
        .await?;
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: Cidr,
        eni_id: &str,
    ) -> Result<(), InfraError> {
        let destination = destination.to_string();
        self.run(
            "create-route",
            &[
                "--route-table-id",
                route_table_id,
                "--destination-cidr-block",
                &destination,
                "--network-interface-id",
                eni_id,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_route(
        &self,
        route_table_id: &str,
        destination: Cidr,
    ) -> Result<(), InfraError> {
        let destination = destination.to_string();
        let result = self
            .run(
                "delete-route",
                &[
                    "--route-table-id",
                    route_table_id,
                    "--destination-cidr-block",
                    &destination,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(InfraError::Provider { message, .. }) if message.contains("InvalidRoute") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn reachable(
        &self,
        via_public_ip: Ipv4Addr,
        ssh_user: &str,
        ssh_key_path: &Path,
        target: Ipv4Addr,
    ) -> Result<bool, InfraError> {
        let destination = format!("{ssh_user}@{via_public_ip}");
        let ping = format!("ping -c 1 -W 3 {target}");
        let output = Command::new("ssh")
            .arg("-i")
            .arg(ssh_key_path)
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "BatchMode=yes",
                &destination,
                &ping,
            ])
            .output()
            .await
            .map_err(|e| InfraError::Provider {
                operation: "ssh".to_string(),
                message: e.to_string(),
            })?;
        Ok(output.status.success())
    }
}
