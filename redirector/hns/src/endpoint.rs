use metadata_redirector_core::Redirect;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;

const PROXY_POLICY_TYPE: &str = "PROXY";

/// A network endpoint as enumerated by the host network service.
///
/// Only the identifier, address, and policy list are interpreted. All other fields are kept
/// as received so that a modified endpoint can be resubmitted whole.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(
        rename = "ID",
        alias = "Id",
        alias = "id",
        default,
        deserialize_with = "null_as_default"
    )]
    pub id: String,

    #[serde(
        rename = "IPAddress",
        alias = "IpAddress",
        default,
        deserialize_with = "null_as_default"
    )]
    pub ip_address: String,

    /// Opaque policy entries, in backend order.
    #[serde(rename = "Policies", default, deserialize_with = "null_as_default")]
    pub policies: Vec<Value>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Redirects traffic for `IP:Port` to `Destination`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPolicy {
    #[serde(rename = "Type")]
    pub kind: String,

    #[serde(rename = "IP", default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    #[serde(rename = "Port", default, skip_serializing_if = "String::is_empty")]
    pub port: String,

    #[serde(rename = "Destination")]
    pub destination: String,
}

/// The part of a policy entry used to match it against a target address.
#[derive(Deserialize)]
struct PolicyTarget {
    #[serde(rename = "IP", alias = "Ip", alias = "ip", default)]
    ip: Option<String>,
}

// === impl Endpoint ===

impl Endpoint {
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip_address.parse().ok()
    }

    /// Removes every policy entry that targets `target`, returning how many were removed.
    ///
    /// Entries that cannot be decoded never match and are left in place.
    pub fn remove_redirect(&mut self, target: IpAddr) -> usize {
        let before = self.policies.len();
        self.policies.retain(|policy| !targets(policy, target));
        before - self.policies.len()
    }

    /// Replaces any policy entries for the redirect's metadata address with a single entry.
    pub fn upsert_redirect(&mut self, redirect: &Redirect) {
        self.remove_redirect(redirect.metadata.ip());
        self.policies.push(ProxyPolicy::from(redirect).into());
    }

    pub fn has_redirect(&self, target: IpAddr) -> bool {
        self.policies.iter().any(|policy| targets(policy, target))
    }
}

/// The service reports unset fields as `null` as well as omitting them.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn targets(policy: &Value, target: IpAddr) -> bool {
    match PolicyTarget::deserialize(policy) {
        Ok(PolicyTarget { ip: Some(ip) }) => ip.parse::<IpAddr>().ok() == Some(target),
        _ => false,
    }
}

// === impl ProxyPolicy ===

impl From<&Redirect> for ProxyPolicy {
    fn from(Redirect { metadata, destination }: &Redirect) -> Self {
        Self {
            kind: PROXY_POLICY_TYPE.to_string(),
            ip: metadata.ip().to_string(),
            port: metadata.port().to_string(),
            // The service expects a bare `addr:port`, without brackets for IPv6.
            destination: format!("{}:{}", destination.ip(), destination.port()),
        }
    }
}

impl From<ProxyPolicy> for Value {
    fn from(policy: ProxyPolicy) -> Self {
        serde_json::json!({
            "Type": policy.kind,
            "IP": policy.ip,
            "Port": policy.port,
            "Destination": policy.destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn redirect() -> Redirect {
        Redirect {
            metadata: "169.254.169.254:80".parse().unwrap(),
            destination: "10.0.0.1:8429".parse().unwrap(),
        }
    }

    fn endpoint(policies: Vec<Value>) -> Endpoint {
        Endpoint {
            id: "ep-0".to_string(),
            ip_address: "10.0.0.5".to_string(),
            policies,
            other: Map::new(),
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut ep = endpoint(vec![]);
        ep.upsert_redirect(&redirect());
        ep.upsert_redirect(&redirect());
        assert_eq!(
            ep.policies,
            vec![json!({
                "Type": "PROXY",
                "IP": "169.254.169.254",
                "Port": "80",
                "Destination": "10.0.0.1:8429",
            })]
        );
    }

    #[test]
    fn upsert_replaces_stale_destination() {
        let acl = json!({"Type": "ACL", "Action": "Allow"});
        let mut ep = endpoint(vec![
            json!({"Type": "PROXY", "IP": "169.254.169.254", "Port": "80", "Destination": "10.0.0.9:1"}),
            acl.clone(),
        ]);
        ep.upsert_redirect(&redirect());
        assert_eq!(ep.policies.len(), 2);
        assert_eq!(ep.policies[0], acl);
        assert_eq!(
            ProxyPolicy::deserialize(&ep.policies[1]).unwrap().destination,
            "10.0.0.1:8429"
        );
    }

    #[test]
    fn removing_absent_target_is_noop() {
        let policies = vec![
            json!({"Type": "PROXY", "IP": "168.63.129.16", "Port": "80", "Destination": "10.0.0.1:1"}),
            json!({"Type": "OutBoundNAT", "ExceptionList": ["10.0.0.0/8"]}),
        ];
        let mut ep = endpoint(policies.clone());
        assert_eq!(ep.remove_redirect("169.254.169.254".parse().unwrap()), 0);
        assert_eq!(ep.policies, policies);
    }

    #[test]
    fn undecodable_entries_are_kept() {
        let target = "169.254.169.254".parse().unwrap();
        let mut ep = endpoint(vec![
            json!("not an object"),
            json!({"IP": 42}),
            json!({"Type": "PROXY", "IP": "169.254.169.254", "Destination": "10.0.0.1:1"}),
            json!(null),
            json!({"Type": "PROXY", "IP": "169.254.169.254", "Destination": "10.0.0.2:1"}),
        ]);
        assert_eq!(ep.remove_redirect(target), 2);
        assert_eq!(
            ep.policies,
            vec![json!("not an object"), json!({"IP": 42}), json!(null)]
        );
        assert!(!ep.has_redirect(target));
    }

    #[test]
    fn decodes_service_field_casing() {
        let ep: Endpoint = serde_json::from_value(json!({
            "id": "testid",
            "IPAddress": "127.10.0.153",
        }))
        .unwrap();
        assert_eq!(ep.id, "testid");
        assert_eq!(ep.ip(), Some("127.10.0.153".parse().unwrap()));
        assert!(ep.policies.is_empty());
    }

    #[test]
    fn null_fields_decode_as_empty() {
        let eps: Vec<Endpoint> = serde_json::from_value(json!([
            {"ID": "ep-9", "IPAddress": null, "Policies": null},
            {"ID": null, "IPAddress": "10.0.0.5"},
        ]))
        .unwrap();
        assert_eq!(eps[0].id, "ep-9");
        assert_eq!(eps[0].ip(), None);
        assert!(eps[0].policies.is_empty());
        assert_eq!(eps[1].id, "");
        assert_eq!(eps[1].ip(), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn serialization_preserves_unknown_fields_and_order() {
        let raw = json!({
            "ID": "ep-1",
            "IPAddress": "10.0.0.7",
            "VirtualNetwork": "vnet-0",
            "MacAddress": "00-15-5D-00-00-01",
            "Policies": [
                {"Type": "ACL", "Id": "a"},
                {"Type": "PROXY", "IP": "169.254.169.254", "Destination": "10.0.0.1:1"},
                {"Type": "ACL", "Id": "b"},
            ],
        });
        let mut ep: Endpoint = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&ep).unwrap(), raw);

        ep.remove_redirect("169.254.169.254".parse().unwrap());
        let ep: Endpoint = serde_json::from_value(serde_json::to_value(&ep).unwrap()).unwrap();
        assert_eq!(
            ep.policies,
            vec![json!({"Type": "ACL", "Id": "a"}), json!({"Type": "ACL", "Id": "b"})]
        );
        assert_eq!(ep.other["VirtualNetwork"], json!("vnet-0"));
    }
}
