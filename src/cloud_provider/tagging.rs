use std::collections::BTreeMap;

use crate::cloud_provider::{Instance, InstanceStatus};
use crate::machine::Machine;

/// Tag key carrying the owning machine's UID; the sole basis for correlating
/// a Machine with its cloud resources.
pub const MACHINE_UID_TAG_KEY: &str = "Machine-UID";
pub const MACHINE_NAME_TAG_KEY: &str = "Name";

/// Full tag set stamped on every resource created for a machine: the
/// ownership pair plus the user's verbatim tags.
pub fn machine_tags(machine: &Machine, user_tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut tags = user_tags.clone();
    tags.insert(MACHINE_NAME_TAG_KEY.to_string(), machine.machine_name());
    tags.insert(MACHINE_UID_TAG_KEY.to_string(), machine.uid());
    tags
}

pub fn uid_tag_matches(tags: &BTreeMap<String, String>, uid: &str) -> bool {
    tags.get(MACHINE_UID_TAG_KEY).map(|v| v == uid).unwrap_or(false)
}

/// Rewrites the ownership tag, leaving everything else untouched. Used by the
/// UID-migration protocol.
pub fn with_migrated_uid(tags: &BTreeMap<String, String>, new_uid: &str) -> BTreeMap<String, String> {
    let mut tags = tags.clone();
    tags.insert(MACHINE_UID_TAG_KEY.to_string(), new_uid.to_string());
    tags
}

fn status_rank(status: InstanceStatus) -> u8 {
    match status {
        InstanceStatus::Running => 0,
        InstanceStatus::Creating => 1,
        InstanceStatus::Unknown => 2,
        InstanceStatus::Deleting => 3,
        InstanceStatus::Deleted => 4,
    }
}

/// Picks the instance a discovery should adopt among several candidates
/// carrying the same UID tag: terminated entries are dropped, running ones
/// win over pending ones. Two parallel reconciles of a recreated machine
/// (same name, new UID) therefore never adopt the wrong instance.
pub fn prefer_non_terminated(candidates: Vec<Instance>) -> Option<Instance> {
    candidates
        .into_iter()
        .filter(|instance| !instance.is_terminated())
        .min_by_key(|instance| status_rank(instance.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::Kind;
    use crate::machine::test_helpers;
    use std::collections::HashMap;

    fn instance(id: &str, status: InstanceStatus) -> Instance {
        Instance {
            id: id.to_string(),
            name: "node-1".to_string(),
            provider_id: None,
            addresses: HashMap::new(),
            status,
        }
    }

    #[test]
    fn test_machine_tags_contains_ownership_pair() {
        // setup:
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({}));
        let user_tags = maplit::btreemap! { "team".to_string() => "platform".to_string() };

        // execute:
        let tags = machine_tags(&machine, &user_tags);

        // verify:
        assert_eq!(tags.get(MACHINE_UID_TAG_KEY), Some(&"abc".to_string()));
        assert_eq!(tags.get(MACHINE_NAME_TAG_KEY), Some(&"node-1".to_string()));
        assert_eq!(tags.get("team"), Some(&"platform".to_string()));
        assert!(uid_tag_matches(&tags, "abc"));
        assert!(!uid_tag_matches(&tags, "def"));
    }

    #[test]
    fn test_with_migrated_uid_rewrites_only_ownership() {
        // setup:
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({}));
        let tags = machine_tags(&machine, &maplit::btreemap! { "team".to_string() => "platform".to_string() });

        // execute:
        let migrated = with_migrated_uid(&tags, "def");

        // verify:
        assert!(uid_tag_matches(&migrated, "def"));
        assert!(!uid_tag_matches(&migrated, "abc"));
        assert_eq!(migrated.get("team"), Some(&"platform".to_string()));
    }

    #[test]
    fn test_prefer_non_terminated() {
        // setup: a terminated leftover next to the live replacement
        let candidates = vec![
            instance("i-dead", InstanceStatus::Deleted),
            instance("i-booting", InstanceStatus::Creating),
            instance("i-live", InstanceStatus::Running),
        ];

        // execute:
        let picked = prefer_non_terminated(candidates).unwrap();

        // verify:
        assert_eq!(picked.id, "i-live");

        // execute & verify: nothing but terminated entries means not found
        assert!(prefer_non_terminated(vec![instance("i-dead", InstanceStatus::Deleted)]).is_none());
    }
}
