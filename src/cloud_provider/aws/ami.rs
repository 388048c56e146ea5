use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, Instant};

use aws_sdk_ec2::types::Filter;
use chrono::DateTime;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::errors::MachineError;
use crate::machine::OperatingSystem;

const AMI_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Process-wide resolved-AMI cache. The single async mutex serializes the
/// miss path: concurrent creations needing the same (region, OS, arch) issue
/// exactly one DescribeImages call.
static AMI_CACHE: Lazy<Mutex<HashMap<CacheKey, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Clone, Eq, Hash, PartialEq)]
struct CacheKey {
    region: String,
    os: OperatingSystem,
    architecture: Architecture,
}

struct CacheEntry {
    resolved_at: Instant,
    ami: String,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Architecture {
    X86_64,
    Arm64,
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        })
    }
}

impl FromStr for Architecture {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "x86_64" | "amd64" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            _ => Err(()),
        }
    }
}

struct ImageFilter {
    owner: &'static str,
    description: &'static str,
    /// Extra pre-filter on the image name, applied to the candidate set.
    name_prefix: Option<&'static str>,
}

fn image_filter(os: OperatingSystem, architecture: Architecture) -> Result<ImageFilter, MachineError> {
    let filter = match (os, architecture) {
        (OperatingSystem::Ubuntu, _) => ImageFilter {
            owner: "099720109477",
            description: "Canonical, Ubuntu, 22.04 LTS*",
            name_prefix: None,
        },
        (OperatingSystem::CentOs, Architecture::X86_64) => ImageFilter {
            owner: "125523088429",
            description: "CentOS Linux 7* x86_64*",
            name_prefix: None,
        },
        (OperatingSystem::CentOs, Architecture::Arm64) => ImageFilter {
            owner: "125523088429",
            description: "CentOS Linux 7* aarch64*",
            name_prefix: None,
        },
        (OperatingSystem::Rhel, _) => ImageFilter {
            owner: "309956199498",
            description: "Provided by Red Hat*",
            name_prefix: Some("RHEL-8"),
        },
        (OperatingSystem::RockyLinux, _) => ImageFilter {
            owner: "792107900819",
            description: "Rocky Linux 8*",
            name_prefix: None,
        },
        (OperatingSystem::AmazonLinux2, _) => ImageFilter {
            owner: "137112412989",
            description: "Amazon Linux 2 AMI*",
            name_prefix: Some("amzn2-ami-hvm"),
        },
        (OperatingSystem::Flatcar, _) => ImageFilter {
            owner: "075585003325",
            description: "Flatcar Container Linux stable*",
            name_prefix: None,
        },
        (OperatingSystem::Windows, _) => {
            return Err(MachineError::new_invalid_configuration(
                "windows requires an explicit ami in the provider spec".to_string(),
            ));
        }
    };
    Ok(filter)
}

/// Resolves the default image for (region, OS, architecture). Among the
/// candidates returned by the cloud, the most recently created one wins.
pub async fn default_ami(
    client: &aws_sdk_ec2::Client,
    region: &str,
    os: OperatingSystem,
    architecture: Architecture,
) -> Result<String, MachineError> {
    let key = CacheKey {
        region: region.to_string(),
        os,
        architecture,
    };

    let mut cache = AMI_CACHE.lock().await;
    if let Some(entry) = cache.get(&key) {
        if entry.resolved_at.elapsed() < AMI_CACHE_TTL {
            return Ok(entry.ami.clone());
        }
    }

    let filter = image_filter(os, architecture)?;
    let output = client
        .describe_images()
        .owners(filter.owner)
        .filters(Filter::builder().name("description").values(filter.description).build())
        .filters(Filter::builder().name("architecture").values(architecture.to_string()).build())
        .filters(Filter::builder().name("virtualization-type").values("hvm").build())
        .filters(Filter::builder().name("root-device-type").values("ebs").build())
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(|e| super::classify_sdk_error("DescribeImages", &e))?;

    let mut candidates: Vec<_> = output
        .images
        .unwrap_or_default()
        .into_iter()
        .filter(|image| match filter.name_prefix {
            Some(prefix) => image.name().map(|n| n.starts_with(prefix)).unwrap_or(false),
            None => true,
        })
        .collect();

    candidates.sort_by_key(|image| {
        image
            .creation_date()
            .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
    });

    let newest = candidates.last().and_then(|image| image.image_id()).ok_or_else(|| {
        MachineError::new_invalid_configuration(format!(
            "no default image found for os `{os}` (architecture {architecture}) in region `{region}`"
        ))
    })?;

    cache.insert(
        key,
        CacheEntry {
            resolved_at: Instant::now(),
            ami: newest.to_string(),
        },
    );

    Ok(newest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_parsing() {
        // execute & verify:
        assert_eq!(Architecture::from_str("").unwrap(), Architecture::X86_64);
        assert_eq!(Architecture::from_str("amd64").unwrap(), Architecture::X86_64);
        assert_eq!(Architecture::from_str("aarch64").unwrap(), Architecture::Arm64);
        assert!(Architecture::from_str("riscv64").is_err());
    }

    #[test]
    fn test_image_filter_table() {
        // execute & verify: the CentOS lookup is pinned to the upstream owner
        let centos = image_filter(OperatingSystem::CentOs, Architecture::X86_64).unwrap();
        assert_eq!(centos.owner, "125523088429");
        assert_eq!(centos.description, "CentOS Linux 7* x86_64*");

        // execute & verify: RHEL candidates are pre-filtered by name
        let rhel = image_filter(OperatingSystem::Rhel, Architecture::X86_64).unwrap();
        assert_eq!(rhel.name_prefix, Some("RHEL-8"));

        // execute & verify: windows has no default image
        assert!(image_filter(OperatingSystem::Windows, Architecture::X86_64).is_err());
    }
}
