use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_ec2::config::BehaviorVersion;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification, InstanceMarketOptionsRequest,
    InstanceNetworkInterfaceSpecification, InstanceStateName, InstanceType, MarketType, ResourceType,
    SpotInstanceType, SpotMarketOptions, Tag, TagSpecification, VolumeType,
};
use aws_types::region::Region;
use serde::{Deserialize, Serialize};

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::tagging::{MACHINE_UID_TAG_KEY, machine_tags, prefer_non_terminated};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarBool, ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::MachineError;
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};
use crate::utilities::gzip_base64;

pub mod ami;

pub use ami::Architecture;

const FINALIZER_INSTANCE: &str = "machine-engine/aws-instance";

/// EC2 rejects user-data beyond 16 KiB, measured after base64 encoding.
const USER_DATA_MAX_BYTES: usize = 16 * 1024;

const SPOT_INSTANCE_LABEL: &str = "machine-engine.io/spot-instance";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub access_key_id: ConfigVarString,
    pub secret_access_key: ConfigVarString,
    pub assume_role_arn: ConfigVarString,
    pub assume_role_external_id: ConfigVarString,
    pub region: ConfigVarString,
    pub availability_zone: ConfigVarString,
    pub vpc_id: ConfigVarString,
    pub subnet_id: ConfigVarString,
    pub security_group_ids: Vec<ConfigVarString>,
    pub instance_profile: ConfigVarString,
    pub instance_type: ConfigVarString,
    pub architecture: ConfigVarString,
    pub ami: ConfigVarString,
    pub disk_size: Option<i32>,
    pub disk_type: ConfigVarString,
    pub disk_iops: Option<i32>,
    pub ebs_volume_encrypted: ConfigVarBool,
    pub assign_public_ip: Option<bool>,
    pub is_spot_instance: Option<bool>,
    pub spot_max_price: ConfigVarString,
    pub tags: BTreeMap<String, String>,
}

/// RawConfig with every ConfigVar resolved to a plain value.
struct Config {
    access_key_id: String,
    secret_access_key: String,
    assume_role_arn: String,
    assume_role_external_id: String,
    region: String,
    availability_zone: String,
    vpc_id: String,
    subnet_id: String,
    security_group_ids: Vec<String>,
    instance_profile: String,
    instance_type: String,
    architecture: Architecture,
    ami: String,
    disk_size: i32,
    disk_type: String,
    disk_iops: Option<i32>,
    ebs_volume_encrypted: bool,
    assign_public_ip: bool,
    is_spot_instance: bool,
    spot_max_price: String,
    tags: BTreeMap<String, String>,
}

pub struct AwsProvider {
    resolver: ConfigVarResolver,
}

impl AwsProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        AwsProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse aws provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let mut security_group_ids = Vec::with_capacity(raw.security_group_ids.len());
        for id in &raw.security_group_ids {
            security_group_ids.push(self.resolver.get_string(id).await?);
        }

        let architecture_raw = self.resolver.get_string(&raw.architecture).await?;
        let architecture = Architecture::from_str(&architecture_raw)
            .map_err(|_| MachineError::new_unsupported_architecture(&architecture_raw, "aws"))?;

        Ok(Config {
            access_key_id: self
                .resolver
                .get_string_or_env(&raw.access_key_id, constants::AWS_ACCESS_KEY_ID)
                .await?,
            secret_access_key: self
                .resolver
                .get_string_or_env(&raw.secret_access_key, constants::AWS_SECRET_ACCESS_KEY)
                .await?,
            assume_role_arn: self
                .resolver
                .get_string_or_env(&raw.assume_role_arn, constants::AWS_ASSUME_ROLE_ARN)
                .await?,
            assume_role_external_id: self
                .resolver
                .get_string_or_env(&raw.assume_role_external_id, constants::AWS_ASSUME_ROLE_EXTERNAL_ID)
                .await?,
            region: self.resolver.get_string(&raw.region).await?,
            availability_zone: self.resolver.get_string(&raw.availability_zone).await?,
            vpc_id: self.resolver.get_string(&raw.vpc_id).await?,
            subnet_id: self.resolver.get_string(&raw.subnet_id).await?,
            security_group_ids,
            instance_profile: self.resolver.get_string(&raw.instance_profile).await?,
            instance_type: self.resolver.get_string(&raw.instance_type).await?,
            architecture,
            ami: self.resolver.get_string(&raw.ami).await?,
            disk_size: raw.disk_size.unwrap_or(25),
            disk_type: self.resolver.get_string(&raw.disk_type).await?,
            disk_iops: raw.disk_iops,
            ebs_volume_encrypted: self.resolver.get_bool(&raw.ebs_volume_encrypted).await?.0,
            assign_public_ip: raw.assign_public_ip.unwrap_or(true),
            is_spot_instance: raw.is_spot_instance.unwrap_or(false),
            spot_max_price: self.resolver.get_string(&raw.spot_max_price).await?,
            tags: raw.tags,
        })
    }

    async fn ec2_client(&self, config: &Config) -> Result<aws_sdk_ec2::Client, MachineError> {
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "aws credentials are not configured".to_string(),
            ));
        }

        let mut credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "machine-engine",
        );

        if !config.assume_role_arn.is_empty() {
            let sts_config = aws_sdk_sts::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .credentials_provider(SharedCredentialsProvider::new(credentials))
                .build();
            let sts = aws_sdk_sts::Client::from_conf(sts_config);

            let mut request = sts
                .assume_role()
                .role_arn(&config.assume_role_arn)
                .role_session_name("machine-engine");
            if !config.assume_role_external_id.is_empty() {
                request = request.external_id(&config.assume_role_external_id);
            }
            let assumed = request.send().await.map_err(|e| {
                MachineError::new_auth_failure(format!(
                    "cannot assume role `{}`: {e}",
                    config.assume_role_arn
                ))
            })?;

            let session = assumed.credentials().ok_or_else(|| {
                MachineError::new_auth_failure("AssumeRole returned no credentials".to_string())
            })?;
            credentials = Credentials::new(
                session.access_key_id(),
                session.secret_access_key(),
                Some(session.session_token().to_string()),
                None,
                "machine-engine-sts",
            );
        }

        let ec2_config = aws_sdk_ec2::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .build();

        Ok(aws_sdk_ec2::Client::from_conf(ec2_config))
    }

    async fn resolve_ami(
        &self,
        client: &aws_sdk_ec2::Client,
        config: &Config,
        spec: &MachineSpec,
    ) -> Result<String, MachineError> {
        if !config.ami.is_empty() {
            return Ok(config.ami.clone());
        }
        ami::default_ami(
            client,
            &config.region,
            spec.provider_spec.operating_system,
            config.architecture,
        )
        .await
    }

    async fn describe_instances_by_uid(
        &self,
        client: &aws_sdk_ec2::Client,
        uid: &str,
    ) -> Result<Vec<aws_sdk_ec2::types::Instance>, MachineError> {
        let mut instances = vec![];
        let mut next_token: Option<String> = None;

        loop {
            let output = client
                .describe_instances()
                .filters(Filter::builder().name(format!("tag:{MACHINE_UID_TAG_KEY}")).values(uid).build())
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| classify_sdk_error("DescribeInstances", &e))?;

            for reservation in output.reservations.unwrap_or_default() {
                instances.extend(reservation.instances.unwrap_or_default());
            }

            next_token = output.next_token;
            if next_token.is_none() {
                return Ok(instances);
            }
        }
    }

    fn validate_disk(config: &Config) -> Result<(), MachineError> {
        match config.disk_type.as_str() {
            "io1" => match config.disk_iops {
                Some(iops) if (100..=64_000).contains(&iops) => Ok(()),
                Some(iops) => Err(MachineError::new_invalid_configuration(format!(
                    "disk iops `{iops}` out of range [100, 64000] for io1"
                ))),
                None => Err(MachineError::new_invalid_configuration(
                    "disk type io1 requires diskIops".to_string(),
                )),
            },
            "gp3" => match config.disk_iops {
                Some(iops) if !(3_000..=64_000).contains(&iops) => Err(MachineError::new_invalid_configuration(
                    format!("disk iops `{iops}` out of range [3000, 64000] for gp3"),
                )),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

pub(crate) fn classify_sdk_error<E>(operation: &str, err: &SdkError<E>) -> MachineError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let code = err
        .as_service_error()
        .and_then(|service_error| service_error.meta().code())
        .unwrap_or_default();

    match code {
        "AuthFailure" | "UnauthorizedOperation" | "InvalidClientTokenId" | "SignatureDoesNotMatch" => {
            MachineError::new_auth_failure(format!("AWS {operation}: {code}"))
        }
        "OptInRequired" => MachineError::new_ami_terms_not_accepted(format!(
            "AWS {operation}: the image's terms have not been accepted: {code}"
        )),
        "InstanceLimitExceeded" | "VcpuLimitExceeded" | "InsufficientInstanceCapacity" | "MaxSpotInstanceCountExceeded" => {
            MachineError::new_insufficient_resources(format!("AWS {operation}: {code}"))
        }
        "InvalidParameterValue" | "InvalidParameterCombination" | "InvalidAMIID.NotFound" | "InvalidAMIID.Malformed"
        | "InvalidSubnetID.NotFound" | "InvalidGroup.NotFound" | "InvalidVpcID.NotFound" => {
            MachineError::new_invalid_configuration(format!("AWS {operation}: {code}"))
        }
        _ => MachineError::new_retryable(format!("AWS {operation} failed"), Some(format!("{err:?}"))),
    }
}

fn map_instance_state(state: Option<&InstanceStateName>) -> InstanceStatus {
    match state {
        Some(InstanceStateName::Pending) => InstanceStatus::Creating,
        Some(InstanceStateName::Running) => InstanceStatus::Running,
        Some(InstanceStateName::ShuttingDown) => InstanceStatus::Deleting,
        Some(InstanceStateName::Terminated) => InstanceStatus::Deleted,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_view(ec2_instance: &aws_sdk_ec2::types::Instance) -> Instance {
    let mut addresses = HashMap::new();
    if let Some(ip) = ec2_instance.private_ip_address() {
        addresses.insert(ip.to_string(), AddressType::InternalIp);
    }
    if let Some(ip) = ec2_instance.public_ip_address() {
        addresses.insert(ip.to_string(), AddressType::ExternalIp);
    }
    if let Some(dns) = ec2_instance.private_dns_name() {
        if !dns.is_empty() {
            addresses.insert(dns.to_string(), AddressType::InternalDns);
        }
    }
    if let Some(dns) = ec2_instance.public_dns_name() {
        if !dns.is_empty() {
            addresses.insert(dns.to_string(), AddressType::ExternalDns);
        }
    }

    let id = ec2_instance.instance_id().unwrap_or_default().to_string();
    let availability_zone = ec2_instance
        .placement()
        .and_then(|p| p.availability_zone())
        .unwrap_or_default();
    let name = ec2_instance
        .tags()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(|tag| tag.value())
        .unwrap_or_default()
        .to_string();

    Instance {
        provider_id: Some(format!("aws:///{availability_zone}/{id}")),
        id,
        name,
        addresses,
        status: map_instance_state(ec2_instance.state().and_then(|s| s.name())),
    }
}

fn tags_of(config: &Config, machine: &Machine) -> Vec<Tag> {
    machine_tags(machine, &config.tags)
        .into_iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

#[async_trait]
impl Provider for AwsProvider {
    fn kind(&self) -> Kind {
        Kind::Aws
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.disk_type.value.is_empty() && raw.disk_type.secret_key_ref.is_none() && raw.disk_type.env_var_name.is_none()
        {
            raw.disk_type = ConfigVarString::from_literal("standard");
        }
        if raw.disk_size.is_none() {
            raw.disk_size = Some(25);
        }
        if raw.assign_public_ip.is_none() {
            raw.assign_public_ip = Some(true);
        }
        if raw.is_spot_instance == Some(true) {
            spec.labels
                .insert(SPOT_INSTANCE_LABEL.to_string(), "true".to_string());
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize aws provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        if config.region.is_empty() || config.availability_zone.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "region and availabilityZone must be configured".to_string(),
            ));
        }
        if config.instance_type.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "instanceType must be configured".to_string(),
            ));
        }
        Self::validate_disk(&config)?;

        let client = self.ec2_client(&config).await?;

        if !config.vpc_id.is_empty() {
            client
                .describe_vpcs()
                .vpc_ids(&config.vpc_id)
                .send()
                .await
                .map_err(|e| classify_sdk_error("DescribeVpcs", &e))?;
        }

        if !config.subnet_id.is_empty() {
            let subnets = client
                .describe_subnets()
                .subnet_ids(&config.subnet_id)
                .send()
                .await
                .map_err(|e| classify_sdk_error("DescribeSubnets", &e))?;
            let in_zone = subnets
                .subnets()
                .iter()
                .any(|subnet| subnet.availability_zone() == Some(config.availability_zone.as_str()));
            if !in_zone {
                return Err(MachineError::new_invalid_configuration(format!(
                    "subnet `{}` is not in availability zone `{}`",
                    config.subnet_id, config.availability_zone
                )));
            }
        }

        if !config.security_group_ids.is_empty() {
            client
                .describe_security_groups()
                .set_group_ids(Some(config.security_group_ids.clone()))
                .send()
                .await
                .map_err(|e| classify_sdk_error("DescribeSecurityGroups", &e))?;
        }

        // resolves the default image too, so an unsupported OS fails here
        self.resolve_ami(&client, &config, spec).await?;

        Ok(())
    }

    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError> {
        let config = self.config(spec).await?;
        let cloud_config = format!(
            r#"[global]
Zone={}
VPC={}
SubnetID={}
"#,
            config.availability_zone, config.vpc_id, config.subnet_id
        );
        Ok((cloud_config, "aws".to_string()))
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.ec2_client(&config).await?;

        let encoded_userdata = gzip_base64(userdata)?;
        if encoded_userdata.len() > USER_DATA_MAX_BYTES {
            return Err(MachineError::new_invalid_configuration(format!(
                "user-data is {} bytes after compression, EC2 caps it at {USER_DATA_MAX_BYTES}",
                encoded_userdata.len()
            )));
        }

        let ami = self.resolve_ami(&client, &config, &machine.spec).await?;

        // the instance is the only resource needing cleanup, volumes and the
        // NIC terminate with it
        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let mut ebs = EbsBlockDevice::builder()
            .volume_size(config.disk_size)
            .volume_type(VolumeType::from(config.disk_type.as_str()))
            .encrypted(config.ebs_volume_encrypted)
            .delete_on_termination(true);
        if let Some(iops) = config.disk_iops {
            ebs = ebs.iops(iops);
        }

        let network_interface = InstanceNetworkInterfaceSpecification::builder()
            .device_index(0)
            .associate_public_ip_address(config.assign_public_ip)
            .subnet_id(&config.subnet_id)
            .set_groups(Some(config.security_group_ids.clone()))
            .build();

        let mut request = client
            .run_instances()
            .image_id(ami)
            .instance_type(InstanceType::from(config.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .user_data(&encoded_userdata)
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/sda1")
                    .ebs(ebs.build())
                    .build(),
            )
            .network_interfaces(network_interface)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(tags_of(&config, &machine)))
                    .build(),
            )
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Volume)
                    .set_tags(Some(tags_of(&config, &machine)))
                    .build(),
            );

        if !config.instance_profile.is_empty() {
            request = request.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(&config.instance_profile)
                    .build(),
            );
        }

        if config.is_spot_instance {
            let mut spot_options = SpotMarketOptions::builder().spot_instance_type(SpotInstanceType::OneTime);
            if !config.spot_max_price.is_empty() {
                spot_options = spot_options.max_price(&config.spot_max_price);
            }
            request = request.instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .spot_options(spot_options.build())
                    .build(),
            );
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify_sdk_error("RunInstances", &e))?;
        let instance_id = output
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .unwrap_or_default()
            .to_string();
        info!("aws instance `{instance_id}` issued for machine `{}`", machine.machine_name());

        // the tag is written at creation, the instance just has to show up in
        // tag-filtered discovery
        match poll_immediate(INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, || async {
            match self.get(&machine, data).await {
                Ok(_) => Ok(true),
                Err(err) if err.is_not_found() => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
        {
            Ok(()) => self.get(&machine, data).await,
            Err(PollError::Timeout(waited)) => Err(MachineError::new_instance_not_ready(&machine.machine_name(), waited)),
            Err(PollError::Failed(err)) => Err(err),
        }
    }

    async fn get(&self, machine: &Machine, _data: &ProviderData) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.ec2_client(&config).await?;

        let candidates = self
            .describe_instances_by_uid(&client, &machine.uid())
            .await?
            .iter()
            .map(instance_view)
            .collect();

        prefer_non_terminated(candidates).ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.ec2_client(&config).await?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let live: Vec<_> = self
                .describe_instances_by_uid(&client, &machine.uid())
                .await?
                .iter()
                .map(instance_view)
                .filter(|instance| !instance.is_terminated())
                .collect();

            if live.is_empty() {
                return Ok(true);
            }

            let ids: Vec<String> = live
                .iter()
                .filter(|instance| instance.status != InstanceStatus::Deleting)
                .map(|instance| instance.id.clone())
                .collect();
            if !ids.is_empty() {
                client
                    .terminate_instances()
                    .set_instance_ids(Some(ids))
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error("TerminateInstances", &e))?;
            }

            // termination was issued, the next reconcile observes the drain
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.ec2_client(&config).await?;

        let instances = self.describe_instances_by_uid(&client, &machine.uid()).await?;
        let mut resources = vec![];
        for ec2_instance in &instances {
            if let Some(id) = ec2_instance.instance_id() {
                resources.push(id.to_string());
            }
            for mapping in ec2_instance.block_device_mappings() {
                if let Some(volume_id) = mapping.ebs().and_then(|ebs| ebs.volume_id()) {
                    resources.push(volume_id.to_string());
                }
            }
            for nic in ec2_instance.network_interfaces() {
                if let Some(nic_id) = nic.network_interface_id() {
                    resources.push(nic_id.to_string());
                }
            }
        }

        if resources.is_empty() {
            return Ok(());
        }

        // rewriting the key overwrites the old value, no resource ever holds both
        client
            .create_tags()
            .set_resources(Some(resources))
            .tags(Tag::builder().key(MACHINE_UID_TAG_KEY).value(new_uid).build())
            .send()
            .await
            .map_err(|e| classify_sdk_error("CreateTags", &e))?;

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.instance_type.value.clone()),
            ("region".to_string(), raw.region.value.clone()),
            ("zone".to_string(), raw.availability_zone.value.clone()),
            ("ami".to_string(), raw.ami.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        // one list call per distinct credential tuple, not per machine
        let mut by_credentials: HashMap<(String, String, String, String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((
                    config.access_key_id,
                    config.secret_access_key,
                    config.region,
                    config.assume_role_arn,
                    config.assume_role_external_id,
                ))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let client = self.ec2_client(&config).await?;

            let output = client
                .describe_instances()
                .filters(Filter::builder().name("tag-key").values(MACHINE_UID_TAG_KEY).build())
                .send()
                .await
                .map_err(|e| classify_sdk_error("DescribeInstances", &e))?;

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for reservation in output.reservations() {
                for ec2_instance in reservation.instances() {
                    if map_instance_state(ec2_instance.state().and_then(|s| s.name())) == InstanceStatus::Deleted {
                        continue;
                    }
                    if let Some(uid) = ec2_instance
                        .tags()
                        .iter()
                        .find(|tag| tag.key() == Some(MACHINE_UID_TAG_KEY))
                        .and_then(|tag| tag.value())
                    {
                        *count_by_uid.entry(uid.to_string()).or_default() += 1.0;
                    }
                }
            }

            for machine in machines.iter() {
                let count = count_by_uid.get(&machine.uid()).copied().unwrap_or(0.0);
                crate::metrics::INSTANCES_FOR_MACHINE.set(&machine.machine_name(), count);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::test_helpers;

    fn spec_with(config: serde_json::Value) -> MachineSpec {
        test_helpers::machine("node-1", "abc", Kind::Aws, config).spec
    }

    fn provider() -> AwsProvider {
        use crate::config::InMemorySecretStore;
        use std::sync::Arc;
        AwsProvider::new(ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())))
    }

    #[test]
    fn test_add_defaults_fills_disk_and_public_ip() {
        // setup:
        let spec = spec_with(serde_json::json!({"region": "eu-west-1"}));

        // execute:
        let defaulted = provider().add_defaults(spec).unwrap();
        let raw: RawConfig = serde_json::from_value(defaulted.provider_spec.cloud_provider_spec.clone()).unwrap();

        // verify:
        assert_eq!(raw.disk_type.value, "standard");
        assert_eq!(raw.disk_size, Some(25));
        assert_eq!(raw.assign_public_ip, Some(true));
    }

    #[test]
    fn test_add_defaults_is_idempotent() {
        // setup:
        let spec = spec_with(serde_json::json!({"region": "eu-west-1", "isSpotInstance": true}));

        // execute:
        let once = provider().add_defaults(spec).unwrap();
        let twice = provider().add_defaults(once.clone()).unwrap();

        // verify:
        assert_eq!(
            serde_json::to_value(&once.provider_spec.cloud_provider_spec).unwrap(),
            serde_json::to_value(&twice.provider_spec.cloud_provider_spec).unwrap()
        );
        assert_eq!(once.labels.get(SPOT_INSTANCE_LABEL), Some(&"true".to_string()));
    }

    #[test]
    fn test_disk_validation_boundaries() {
        // setup:
        let base = |disk_type: &str, iops: Option<i32>| Config {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            assume_role_arn: String::new(),
            assume_role_external_id: String::new(),
            region: String::new(),
            availability_zone: String::new(),
            vpc_id: String::new(),
            subnet_id: String::new(),
            security_group_ids: vec![],
            instance_profile: String::new(),
            instance_type: String::new(),
            architecture: Architecture::X86_64,
            ami: String::new(),
            disk_size: 25,
            disk_type: disk_type.to_string(),
            disk_iops: iops,
            ebs_volume_encrypted: false,
            assign_public_ip: true,
            is_spot_instance: false,
            spot_max_price: String::new(),
            tags: BTreeMap::new(),
        };

        // execute & verify: io1 requires iops within [100, 64000]
        assert!(AwsProvider::validate_disk(&base("io1", None)).is_err());
        assert!(AwsProvider::validate_disk(&base("io1", Some(99))).is_err());
        assert!(AwsProvider::validate_disk(&base("io1", Some(100))).is_ok());
        assert!(AwsProvider::validate_disk(&base("io1", Some(64_000))).is_ok());
        assert!(AwsProvider::validate_disk(&base("io1", Some(64_001))).is_err());

        // execute & verify: gp3 tolerates unset iops, bounds explicit ones
        assert!(AwsProvider::validate_disk(&base("gp3", None)).is_ok());
        assert!(AwsProvider::validate_disk(&base("gp3", Some(2_999))).is_err());
        assert!(AwsProvider::validate_disk(&base("gp3", Some(3_000))).is_ok());

        // execute & verify: other types ignore iops
        assert!(AwsProvider::validate_disk(&base("gp2", None)).is_ok());
    }

    #[test]
    fn test_metrics_labels() {
        // setup:
        let spec = spec_with(serde_json::json!({
            "region": "eu-west-1",
            "availabilityZone": "eu-west-1a",
            "instanceType": "t3.large",
            "ami": "ami-0123"
        }));

        // execute:
        let labels = provider().machine_metrics_labels(&test_helpers::machine("n", "u", Kind::Aws, spec.provider_spec.cloud_provider_spec.clone())).unwrap();

        // verify:
        assert_eq!(labels.get("size"), Some(&"t3.large".to_string()));
        assert_eq!(labels.get("region"), Some(&"eu-west-1".to_string()));
        assert_eq!(labels.get("zone"), Some(&"eu-west-1a".to_string()));
        assert_eq!(labels.get("ami"), Some(&"ami-0123".to_string()));
    }
}
