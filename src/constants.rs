// Environment variable fallbacks recognized by the config resolver when a
// ConfigVar carries neither a literal nor a secret reference.

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_ASSUME_ROLE_ARN: &str = "AWS_ASSUME_ROLE_ARN";
pub const AWS_ASSUME_ROLE_EXTERNAL_ID: &str = "AWS_ASSUME_ROLE_EXTERNAL_ID";

pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const AZURE_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";

pub const OS_AUTH_URL: &str = "OS_AUTH_URL";
pub const OS_USER_NAME: &str = "OS_USER_NAME";
pub const OS_PASSWORD: &str = "OS_PASSWORD";
pub const OS_DOMAIN_NAME: &str = "OS_DOMAIN_NAME";
pub const OS_PROJECT_NAME: &str = "OS_PROJECT_NAME";
pub const OS_REGION_NAME: &str = "OS_REGION_NAME";

pub const GOOGLE_SERVICE_ACCOUNT: &str = "GOOGLE_SERVICE_ACCOUNT";

pub const HZ_TOKEN: &str = "HZ_TOKEN";
pub const DO_TOKEN: &str = "DO_TOKEN";
pub const LINODE_TOKEN: &str = "LINODE_TOKEN";

pub const METAL_AUTH_TOKEN: &str = "METAL_AUTH_TOKEN";
pub const METAL_PROJECT_ID: &str = "METAL_PROJECT_ID";
// legacy names kept for the deprecated `packet` provider tag
pub const PACKET_API_KEY: &str = "PACKET_API_KEY";
pub const PACKET_PROJECT_ID: &str = "PACKET_PROJECT_ID";

pub const VSPHERE_ADDRESS: &str = "VSPHERE_ADDRESS";
pub const VSPHERE_USERNAME: &str = "VSPHERE_USERNAME";
pub const VSPHERE_PASSWORD: &str = "VSPHERE_PASSWORD";

pub const ALIBABA_ACCESS_KEY_ID: &str = "ALIBABA_ACCESS_KEY_ID";
pub const ALIBABA_ACCESS_KEY_SECRET: &str = "ALIBABA_ACCESS_KEY_SECRET";

pub const KUBEVIRT_KUBECONFIG: &str = "KUBEVIRT_KUBECONFIG";

pub const NUTANIX_ENDPOINT: &str = "NUTANIX_ENDPOINT";
pub const NUTANIX_PORT: &str = "NUTANIX_PORT";
pub const NUTANIX_USERNAME: &str = "NUTANIX_USERNAME";
pub const NUTANIX_PASSWORD: &str = "NUTANIX_PASSWORD";
