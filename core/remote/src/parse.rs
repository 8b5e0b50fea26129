//! Mapping of PCE JSON payloads to typed records.

use chrono::{DateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use pcemirror_common::{
    id_from_href, EntityKind, Error, IpList, IpRange, Label, LabelGroup, PolicyDecision, Resource,
    Result, Service, ServicePort, TrafficFlow, TrafficQuery, Workload,
};

#[derive(Debug, Deserialize)]
struct HrefRef {
    href: String,
}

fn ref_ids(refs: Vec<HrefRef>) -> Vec<String> {
    refs.iter()
        .filter_map(|r| id_from_href(&r.href))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireWorkload {
    name: Option<String>,
    hostname: Option<String>,
    description: Option<String>,
    public_ip: Option<String>,
    #[serde(default)]
    online: bool,
    os_detail: Option<String>,
    enforcement_mode: Option<String>,
    #[serde(default)]
    labels: Vec<HrefRef>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireFqdn {
    fqdn: String,
}

#[derive(Debug, Deserialize)]
struct WireIpList {
    name: String,
    description: Option<String>,
    #[serde(default)]
    ip_ranges: Vec<IpRange>,
    #[serde(default)]
    fqdns: Vec<WireFqdn>,
}

#[derive(Debug, Deserialize)]
struct WireService {
    name: String,
    description: Option<String>,
    #[serde(default)]
    service_ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct WireLabelGroup {
    name: String,
    key: Option<String>,
    description: Option<String>,
    #[serde(default)]
    labels: Vec<HrefRef>,
}

fn decode<T: DeserializeOwned>(kind: EntityKind, href: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Serialization(format!("Malformed {kind} record {href}: {e}")))
}

/// Map one collection record to a typed resource.
///
/// Records without a usable href cannot be keyed and yield `Ok(None)`.
///
/// # Errors
/// - `Serialization` if a keyed record does not have the expected shape
pub fn parse_resource(kind: EntityKind, value: Value) -> Result<Option<Resource>> {
    let Some(href) = value.get("href").and_then(Value::as_str).map(str::to_string) else {
        debug!("Skipping {} record without href", kind);
        return Ok(None);
    };
    let Some(id) = id_from_href(&href).map(str::to_string) else {
        debug!("Skipping {} record with unusable href {}", kind, href);
        return Ok(None);
    };

    let resource = match kind {
        EntityKind::Workload => {
            let w: WireWorkload = decode(kind, &href, value)?;
            Resource::Workload(Workload {
                id,
                name: w.name,
                hostname: w.hostname,
                description: w.description,
                public_ip: w.public_ip,
                online: w.online,
                os_detail: w.os_detail,
                enforcement_mode: w.enforcement_mode,
                labels: ref_ids(w.labels),
            })
        }
        EntityKind::Label => {
            let l: WireLabel = decode(kind, &href, value)?;
            Resource::Label(Label {
                id,
                key: l.key,
                value: l.value,
            })
        }
        EntityKind::IpList => {
            let i: WireIpList = decode(kind, &href, value)?;
            Resource::IpList(IpList {
                id,
                name: i.name,
                description: i.description,
                ip_ranges: i.ip_ranges,
                fqdns: i.fqdns.into_iter().map(|f| f.fqdn).collect(),
            })
        }
        EntityKind::Service => {
            let s: WireService = decode(kind, &href, value)?;
            Resource::Service(Service {
                id,
                name: s.name,
                description: s.description,
                service_ports: s.service_ports,
            })
        }
        EntityKind::LabelGroup => {
            let g: WireLabelGroup = decode(kind, &href, value)?;
            Resource::LabelGroup(LabelGroup {
                id,
                name: g.name,
                key: g.key,
                description: g.description,
                labels: ref_ids(g.labels),
            })
        }
    };
    Ok(Some(resource))
}

#[derive(Debug, Default, Deserialize)]
struct WireEndpoint {
    ip: Option<String>,
    workload: Option<HrefRef>,
}

#[derive(Debug, Default, Deserialize)]
struct WireFlowService {
    port: Option<i32>,
    proto: Option<i32>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireTimestampRange {
    first_detected: Option<DateTime<Utc>>,
    last_detected: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireFlow {
    #[serde(default)]
    src: WireEndpoint,
    #[serde(default)]
    dst: WireEndpoint,
    #[serde(default)]
    service: WireFlowService,
    policy_decision: Option<String>,
    flow_direction: Option<String>,
    #[serde(default)]
    num_connections: u64,
    dst_bi: Option<u64>,
    dst_bo: Option<u64>,
    #[serde(default)]
    timestamp_range: WireTimestampRange,
    #[serde(default)]
    rules: Value,
}

/// First rule href of a flow; the PCE sends either a list of rule refs or an
/// object keyed by policy version.
fn first_rule_href(rules: &Value) -> Option<String> {
    let list = match rules {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map.get("sec_policy")?.as_array()?.as_slice(),
        _ => return None,
    };
    list.iter()
        .find_map(|rule| rule.get("href")?.as_str().map(str::to_string))
}

/// Map one result row to a typed flow. Returns `None` for malformed rows.
pub fn parse_flow(value: Value) -> Option<TrafficFlow> {
    let flow: WireFlow = match serde_json::from_value(value) {
        Ok(flow) => flow,
        Err(e) => {
            warn!("Skipping malformed traffic flow: {}", e);
            return None;
        }
    };

    let workload_id = |endpoint: &WireEndpoint| {
        endpoint
            .workload
            .as_ref()
            .and_then(|w| id_from_href(&w.href))
            .map(str::to_string)
    };

    Some(TrafficFlow {
        src_workload_id: workload_id(&flow.src),
        dst_workload_id: workload_id(&flow.dst),
        rule_href: first_rule_href(&flow.rules),
        src_ip: flow.src.ip,
        dst_ip: flow.dst.ip,
        service_name: flow.service.name,
        port: flow.service.port,
        proto: flow.service.proto,
        policy_decision: flow
            .policy_decision
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(PolicyDecision::Unknown),
        flow_direction: flow.flow_direction,
        num_connections: flow.num_connections,
        bytes_in: flow.dst_bi,
        bytes_out: flow.dst_bo,
        first_detected: flow.timestamp_range.first_detected,
        last_detected: flow.timestamp_range.last_detected,
    })
}

/// Request body of an async traffic query.
pub fn query_body(query: &TrafficQuery) -> Value {
    let filter = query.effective_filter();
    let start = query.start_date.and_time(NaiveTime::MIN).and_utc();
    let end = query
        .end_date
        .and_hms_opt(23, 59, 59)
        .unwrap_or_else(|| query.end_date.and_time(NaiveTime::MIN))
        .and_utc();

    json!({
        "query_name": query.name,
        "start_date": start.to_rfc3339(),
        "end_date": end.to_rfc3339(),
        "sources": filter.sources,
        "destinations": filter.destinations,
        "services": filter.services,
        "sources_destinations_query_op": "and",
        "policy_decisions": filter.policy_decisions,
        "max_results": query.max_results,
        "exclude_workloads_from_ip_list_query": filter.exclude_workloads_from_ip_list_query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_workload() {
        let value = json!({
            "href": "/orgs/1/workloads/7a1b",
            "hostname": "db01",
            "online": true,
            "public_ip": "203.0.113.9",
            "labels": [{"href": "/orgs/1/labels/12"}, {"href": "/orgs/1/labels/15"}],
            "interfaces": []
        });

        let resource = parse_resource(EntityKind::Workload, value).unwrap().unwrap();
        match resource {
            Resource::Workload(w) => {
                assert_eq!(w.id, "7a1b");
                assert!(w.online);
                assert_eq!(w.labels, vec!["12", "15"]);
            }
            other => panic!("unexpected resource {other:?}"),
        }
    }

    #[test]
    fn test_parse_ip_list_fqdns() {
        let value = json!({
            "href": "/orgs/1/sec_policy/draft/ip_lists/3",
            "name": "Any (0.0.0.0/0)",
            "ip_ranges": [{"from_ip": "0.0.0.0/0", "exclusion": false}],
            "fqdns": [{"fqdn": "*.example.com"}]
        });

        let Ok(Some(Resource::IpList(list))) = parse_resource(EntityKind::IpList, value) else {
            panic!("expected ip list");
        };
        assert_eq!(list.id, "3");
        assert_eq!(list.ip_ranges[0].from_ip, "0.0.0.0/0");
        assert_eq!(list.fqdns, vec!["*.example.com"]);
    }

    #[test]
    fn test_records_without_href_are_skipped() {
        let parsed = parse_resource(EntityKind::Label, json!({"key": "env", "value": "prod"}));
        assert!(parsed.unwrap().is_none());
    }

    #[test]
    fn test_malformed_keyed_record_is_an_error() {
        let err = parse_resource(EntityKind::Service, json!({"href": "/orgs/1/x/9"})).unwrap_err();
        match err {
            Error::Serialization(message) => assert!(message.contains("/orgs/1/x/9")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parse_any_protocol_service() {
        let value = json!({
            "href": "/orgs/1/sec_policy/draft/services/1",
            "name": "All Services",
            "service_ports": [{"proto": -1}]
        });

        let Ok(Some(Resource::Service(service))) = parse_resource(EntityKind::Service, value) else {
            panic!("expected service");
        };
        assert_eq!(service.id, "1");
        assert_eq!(service.service_ports.len(), 1);
        assert_eq!(service.service_ports[0].proto, Some(-1));
        assert_eq!(service.service_ports[0].port, None);
    }

    #[test]
    fn test_parse_flow() {
        let value = json!({
            "src": {"ip": "10.0.0.5", "workload": {"href": "/orgs/1/workloads/w-src"}},
            "dst": {"ip": "10.0.0.9"},
            "service": {"port": 5432, "proto": 6},
            "policy_decision": "potentially_blocked",
            "flow_direction": "outbound",
            "num_connections": 12,
            "dst_bi": 2048,
            "timestamp_range": {
                "first_detected": "2024-03-01T10:00:00Z",
                "last_detected": "2024-03-02T10:00:00Z"
            },
            "rules": {"sec_policy": [{"href": "/orgs/1/sec_policy/active/rule_sets/4/sec_rules/8"}]}
        });

        let flow = parse_flow(value).unwrap();
        assert_eq!(flow.src_workload_id.as_deref(), Some("w-src"));
        assert_eq!(flow.dst_workload_id, None);
        assert_eq!(flow.port, Some(5432));
        assert_eq!(flow.policy_decision, PolicyDecision::PotentiallyBlocked);
        assert_eq!(flow.num_connections, 12);
        assert_eq!(flow.bytes_in, Some(2048));
        assert!(flow.first_detected.is_some());
        assert_eq!(
            flow.rule_href.as_deref(),
            Some("/orgs/1/sec_policy/active/rule_sets/4/sec_rules/8")
        );
    }

    #[test]
    fn test_query_body() {
        let query = TrafficQuery::new(
            "weekly",
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            10_000,
        );

        let body = query_body(&query);
        assert_eq!(body["query_name"], "weekly");
        assert_eq!(body["start_date"], "2024-03-01T00:00:00+00:00");
        assert_eq!(body["end_date"], "2024-03-08T23:59:59+00:00");
        assert_eq!(body["sources"]["include"][0][0]["actors"], "ams");
        assert_eq!(body["max_results"], 10_000);
    }
}
