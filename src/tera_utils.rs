use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose;
use serde_json::Value;
use tera::{Error, try_get_value};

/// This file to declare custom functions / filters and stuff for tera
/// documentation => https://keats.github.io/tera/docs/#advanced-usage

pub trait TeraFilter<'a> {
    fn name() -> &'a str;
    fn implementation() -> fn(&Value, &HashMap<String, Value>) -> Result<Value, Error>;
}

pub trait TeraFunction<'a> {
    fn name() -> &'a str;
    fn implementation() -> fn(&HashMap<String, Value>) -> Result<Value, Error>;
}

/// Encodes string value to base 64.
pub struct Base64EncodeFilter {}

impl Base64EncodeFilter {
    fn base64_encode(s: &str) -> String {
        general_purpose::STANDARD.encode(s)
    }
}

impl<'a> TeraFilter<'a> for Base64EncodeFilter {
    fn name() -> &'a str {
        "base64_encode"
    }

    fn implementation() -> fn(&Value, &HashMap<String, Value>) -> Result<Value, Error> {
        |value: &Value, _: &HashMap<String, Value>| -> Result<Value, Error> {
            let s = try_get_value!("base64_encode", "value", String, value);
            Ok(Value::String(Base64EncodeFilter::base64_encode(&s)))
        }
    }
}

/// Prefixes every line of a literal with `prefix`, preserving the literal
/// otherwise. Blank lines stay blank so YAML block scalars keep their shape.
pub struct IndentFilter {}

impl IndentFilter {
    fn indent(s: &str, prefix: &str) -> String {
        s.lines()
            .map(|line| {
                if line.is_empty() {
                    line.to_string()
                } else {
                    format!("{prefix}{line}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<'a> TeraFilter<'a> for IndentFilter {
    fn name() -> &'a str {
        "indent"
    }

    fn implementation() -> fn(&Value, &HashMap<String, Value>) -> Result<Value, Error> {
        |value: &Value, args: &HashMap<String, Value>| -> Result<Value, Error> {
            let s = try_get_value!("indent", "value", String, value);
            let prefix = match args.get("prefix") {
                Some(prefix) => try_get_value!("indent", "prefix", String, prefix),
                None => "  ".to_string(),
            };
            Ok(Value::String(IndentFilter::indent(&s, &prefix)))
        }
    }
}

/// Joins a list of IP addresses with a comma.
pub struct IpJoinFilter {}

impl<'a> TeraFilter<'a> for IpJoinFilter {
    fn name() -> &'a str {
        "ip_join"
    }

    fn implementation() -> fn(&Value, &HashMap<String, Value>) -> Result<Value, Error> {
        |value: &Value, _: &HashMap<String, Value>| -> Result<Value, Error> {
            let ips = try_get_value!("ip_join", "value", Vec<String>, value);
            Ok(Value::String(ips.join(",")))
        }
    }
}

/// Checks a version against a semver range, e.g.
/// `semver_compare(version="1.23.5", range="< 1.24")`.
pub struct SemverCompareFunction {}

impl SemverCompareFunction {
    fn compare(version: &str, range: &str) -> Result<bool, Error> {
        let version = semver::Version::parse(version.trim_start_matches('v'))
            .map_err(|e| Error::msg(format!("semver_compare: cannot parse version `{version}`: {e}")))?;
        let range = semver::VersionReq::parse(range)
            .map_err(|e| Error::msg(format!("semver_compare: cannot parse range `{range}`: {e}")))?;
        Ok(range.matches(&version))
    }
}

impl<'a> TeraFunction<'a> for SemverCompareFunction {
    fn name() -> &'a str {
        "semver_compare"
    }

    fn implementation() -> fn(&HashMap<String, Value>) -> Result<Value, Error> {
        |args: &HashMap<String, Value>| -> Result<Value, Error> {
            let version = match args.get("version") {
                Some(version) => try_get_value!("semver_compare", "version", String, version),
                None => return Err(Error::msg("semver_compare: missing `version` argument")),
            };
            let range = match args.get("range") {
                Some(range) => try_get_value!("semver_compare", "range", String, range),
                None => return Err(Error::msg("semver_compare: missing `range` argument")),
            };
            Ok(Value::Bool(SemverCompareFunction::compare(&version, &range)?))
        }
    }
}

/// Returns a tera engine with every custom filter and function registered,
/// ready to take raw templates.
pub fn new_tera() -> tera::Tera {
    let mut tera = tera::Tera::default();
    tera.register_filter(Base64EncodeFilter::name(), Base64EncodeFilter::implementation());
    tera.register_filter(IndentFilter::name(), IndentFilter::implementation());
    tera.register_filter(IpJoinFilter::name(), IpJoinFilter::implementation());
    tera.register_function(SemverCompareFunction::name(), SemverCompareFunction::implementation());
    tera
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::value::to_value;
    use tera::Context;

    use super::*;

    #[test]
    fn test_indent_filter() {
        // setup:
        let input = "first\n\nsecond";
        let mut args = HashMap::new();
        args.insert("prefix".to_string(), to_value("    ").unwrap());

        // execute:
        let result = IndentFilter::implementation()(&to_value(input).unwrap(), &args);

        // verify:
        assert_eq!(result.unwrap(), to_value("    first\n\n    second").unwrap());
    }

    #[test]
    fn test_indent_filter_injection() {
        // setup:
        let mut tera = new_tera();
        tera.add_raw_template("test", "content: |\n{{ body | indent(prefix=\"  \") }}")
            .expect("Failed to add Tera raw template");

        let mut context = Context::new();
        context.insert("body", "a: 1\nb: 2");

        // execute:
        let result = tera.render("test", &context).expect("Failed to render Tera template");

        // verify:
        assert_eq!(result, "content: |\n  a: 1\n  b: 2");
    }

    #[test]
    fn test_ip_join_filter() {
        // setup:
        let ips = vec!["10.10.10.10".to_string(), "fd00::10".to_string()];

        // execute:
        let result = IpJoinFilter::implementation()(&to_value(ips).unwrap(), &HashMap::new());

        // verify:
        assert_eq!(result.unwrap(), to_value("10.10.10.10,fd00::10").unwrap());
    }

    #[test]
    fn test_semver_compare_function() {
        // setup:
        let test_cases = vec![
            ("1.22.3", "< 1.23", true),
            ("1.23.0", "< 1.23", false),
            ("v1.23.5", "< 1.24", true),
            ("1.24.0", "< 1.24", false),
            ("1.31.2", ">= 1.29", true),
        ];

        for (version, range, expected) in test_cases {
            // execute:
            let result = SemverCompareFunction::compare(version, range).unwrap();

            // verify:
            assert_eq!(result, expected, "version {version} range {range}");
        }
    }

    #[test]
    fn test_semver_compare_injection() {
        // setup:
        let mut tera = new_tera();
        tera.add_raw_template(
            "test",
            "{% if semver_compare(version=kubelet_version, range=\"< 1.24\") %}--network-plugin=cni{% endif %}",
        )
        .expect("Failed to add Tera raw template");

        let mut context = Context::new();
        context.insert("kubelet_version", "1.23.5");

        // execute:
        let result = tera.render("test", &context).expect("Failed to render Tera template");

        // verify:
        assert_eq!(result, "--network-plugin=cni");
    }
}
