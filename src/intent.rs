//! Annotation translation
//!
//! Turns the free-form annotations of a watched object into a structured
//! forwarding intent: which external ports map to which declared ports,
//! the mapping lease, the enabled default, the remote host filter, and
//! the description override. Parsing is fail-closed: a malformed port-map
//! entry aborts the whole translation so no partial set of mappings is
//! ever issued.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Annotation opting an object into port forwarding.
pub const ANNOTATION_FORWARD: &str = "portfwd.dev/forward";
/// Annotation overriding external ports, `EXTERNAL:INTERNAL` pairs.
pub const ANNOTATION_PORT_MAP: &str = "portfwd.dev/port-map";
/// Annotation toggling the mappings' enabled flag.
pub const ANNOTATION_ENABLED: &str = "portfwd.dev/enabled";
/// Annotation overriding the mapping description.
pub const ANNOTATION_DESCRIPTION: &str = "portfwd.dev/description";
/// Annotation setting the UPnP remote host filter.
pub const ANNOTATION_REMOTE_HOST: &str = "upnp.portfwd.dev/remote-host";
/// Annotation setting the UPnP lease duration.
pub const ANNOTATION_LEASE_DURATION: &str = "upnp.portfwd.dev/lease-duration";

/// Malformed forwarding intent. Aborts the reconciliation pass.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    /// A port-map entry did not split into two non-empty fields or its
    /// external side was not an integer
    #[error("invalid entry {entry} in {} annotation", ANNOTATION_PORT_MAP)]
    InvalidPortMapEntry {
        /// The offending entry
        entry: String,
    },

    /// A port-map entry referenced a port name the object never declared
    #[error("unknown port name {name} in {} annotation entry {entry}", ANNOTATION_PORT_MAP)]
    UnknownPortName {
        /// The offending entry
        entry: String,
        /// The unresolvable name
        name: String,
    },
}

/// One declared port of the watched object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    /// Declared name, possibly empty.
    pub name: String,
    /// Declared port number.
    pub port: u16,
    /// Declared protocol string, e.g. `"TCP"`.
    pub protocol: String,
}

impl ServicePort {
    /// The name used in events and descriptions: the declared name, or
    /// the port number when unnamed.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.port.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// The forward annotation's three observable states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardToggle {
    /// Annotation missing: the object is not managed by this system.
    Absent,
    /// Annotation present but falsy: redundant, reported informationally.
    Falsy(String),
    /// Annotation present and truthy.
    Truthy,
}

/// Read the forward toggle from the annotations.
pub fn forward_toggle(annotations: &BTreeMap<String, String>) -> ForwardToggle {
    match annotations.get(ANNOTATION_FORWARD) {
        None => ForwardToggle::Absent,
        Some(value) if is_truthy(value) => ForwardToggle::Truthy,
        Some(value) => ForwardToggle::Falsy(value.clone()),
    }
}

/// Whether the string is in the truthy set, case-insensitively.
pub fn is_truthy(s: &str) -> bool {
    ["yes", "y", "1", "true"]
        .iter()
        .any(|truthy| s.eq_ignore_ascii_case(truthy))
}

/// Parse a duration string of `<integer><unit>` segments, where unit is
/// one of `ms`, `s`, `m`, `h` (e.g. `90s`, `15m`, `1h30m`).
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return None;
        }

        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (unit, len) = if rest.starts_with("ms") {
            (Duration::from_millis(1), 2)
        } else if rest.starts_with('s') {
            (Duration::from_secs(1), 1)
        } else if rest.starts_with('m') {
            (Duration::from_secs(60), 1)
        } else if rest.starts_with('h') {
            (Duration::from_secs(3600), 1)
        } else {
            return None;
        };

        total += unit * u32::try_from(value).ok()?;
        rest = &rest[len..];
    }

    Some(total)
}

/// Structured forwarding intent derived from annotations.
///
/// Recomputed on every reconciliation, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingIntent {
    /// External port overrides keyed by internal port number.
    pub port_map: HashMap<u16, i32>,
    /// External port overrides keyed by declared port name.
    pub name_map: HashMap<String, i32>,
    /// Enabled default: `None` when the annotation is absent (enabled).
    pub enabled: Option<bool>,
    /// Effective lease duration for the mappings.
    pub lease_duration: Duration,
    /// When the next reconciliation should run.
    pub requeue_after: Duration,
    /// UPnP remote host filter, empty for any host.
    pub remote_host: String,
    /// Description override, if annotated.
    pub description: Option<String>,
}

impl ForwardingIntent {
    /// All external ports resolved for a declared port: the numeric
    /// override, the named override, or the port's own number when
    /// nothing maps it. A value ≤ 0 means "skip this port".
    pub fn external_ports(&self, port: &ServicePort) -> Vec<i32> {
        let mut externals = Vec::new();

        if let Some(external) = self.port_map.get(&port.port) {
            externals.push(*external);
        }
        if !port.name.is_empty() {
            if let Some(external) = self.name_map.get(&port.name) {
                externals.push(*external);
            }
        }

        externals.dedup();

        if externals.is_empty() {
            externals.push(i32::from(port.port));
        }

        externals
    }

    /// Whether mappings should be created enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Mapping description for one port: the annotated override, or a
    /// synthesized `port-forward <namespace>/<name> port <portName>`.
    pub fn description(&self, namespace: &str, name: &str, port: &ServicePort) -> String {
        self.description.clone().unwrap_or_else(|| {
            format!(
                "port-forward {}/{} port {}",
                namespace,
                name,
                port.display_name()
            )
        })
    }
}

/// A successful translation plus warnings to surface as events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// The derived intent.
    pub intent: ForwardingIntent,
    /// Non-fatal annotation problems, e.g. an unparseable lease.
    pub warnings: Vec<String>,
}

/// Translate annotations and declared ports into a forwarding intent.
///
/// `base_requeue` is the reconciliation interval without any lease
/// annotation; the default lease is twice that, and an annotated lease
/// halves into the requeue interval so mappings are refreshed before
/// they expire gateway-side.
pub fn translate(
    annotations: &BTreeMap<String, String>,
    ports: &[ServicePort],
    base_requeue: Duration,
) -> Result<Translation, AnnotationError> {
    let mut port_map = HashMap::new();
    let mut name_map = HashMap::new();
    let mut warnings = Vec::new();

    if let Some(value) = annotations.get(ANNOTATION_PORT_MAP) {
        for entry in value.split(',') {
            let (external_s, internal_s) = entry.split_once(':').ok_or_else(|| {
                AnnotationError::InvalidPortMapEntry {
                    entry: entry.to_string(),
                }
            })?;

            if external_s.is_empty() || internal_s.is_empty() {
                return Err(AnnotationError::InvalidPortMapEntry {
                    entry: entry.to_string(),
                });
            }

            let external: i32 = external_s.parse().map_err(|_| {
                AnnotationError::InvalidPortMapEntry {
                    entry: entry.to_string(),
                }
            })?;

            // Anything ≤ 0 is a deliberate skip signal, but beyond the
            // port range is plain malformed.
            if external > i32::from(u16::MAX) {
                return Err(AnnotationError::InvalidPortMapEntry {
                    entry: entry.to_string(),
                });
            }

            match internal_s.parse::<u16>() {
                Ok(internal) => {
                    port_map.insert(internal, external);
                }
                // Names resolve against the ports declared right now;
                // later redeclaration is not tracked.
                Err(_) if ports.iter().any(|p| p.name == internal_s) => {
                    name_map.insert(internal_s.to_string(), external);
                }
                Err(_) => {
                    return Err(AnnotationError::UnknownPortName {
                        entry: entry.to_string(),
                        name: internal_s.to_string(),
                    });
                }
            }
        }
    }

    let default_lease = base_requeue * 2;
    let mut lease_duration = default_lease;
    let mut requeue_after = base_requeue;

    if let Some(value) = annotations.get(ANNOTATION_LEASE_DURATION) {
        match parse_duration(value) {
            Some(lease) => {
                lease_duration = lease;
                requeue_after = lease / 2;
            }
            None => {
                warnings.push(format!(
                    "using default lease duration {}s due to invalid duration {} in {} annotation",
                    default_lease.as_secs(),
                    value,
                    ANNOTATION_LEASE_DURATION
                ));
            }
        }
    }

    Ok(Translation {
        intent: ForwardingIntent {
            port_map,
            name_map,
            enabled: annotations.get(ANNOTATION_ENABLED).map(|s| is_truthy(s)),
            lease_duration,
            requeue_after,
            remote_host: annotations
                .get(ANNOTATION_REMOTE_HOST)
                .cloned()
                .unwrap_or_default(),
            description: annotations.get(ANNOTATION_DESCRIPTION).cloned(),
        },
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn web_port() -> ServicePort {
        ServicePort {
            name: "web".to_string(),
            port: 80,
            protocol: "TCP".to_string(),
        }
    }

    const BASE: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn test_is_truthy_set() {
        for truthy in ["yes", "y", "1", "true", "YES", "Y", "True", "TRUE", "yEs"] {
            assert!(is_truthy(truthy), "{} should be truthy", truthy);
        }
        for falsy in ["", "no", "n", "0", "false", "tru", "yess", "2", " true"] {
            assert!(!is_truthy(falsy), "{} should be falsy", falsy);
        }
    }

    #[test]
    fn test_forward_toggle_tri_state() {
        assert_eq!(forward_toggle(&annotations(&[])), ForwardToggle::Absent);
        assert_eq!(
            forward_toggle(&annotations(&[(ANNOTATION_FORWARD, "true")])),
            ForwardToggle::Truthy
        );
        assert_eq!(
            forward_toggle(&annotations(&[(ANNOTATION_FORWARD, "no")])),
            ForwardToggle::Falsy("no".to_string())
        );
        assert_eq!(
            forward_toggle(&annotations(&[(ANNOTATION_FORWARD, "")])),
            ForwardToggle::Falsy(String::new())
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));

        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("not-a-duration"), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("-5m"), None);
        assert_eq!(parse_duration("10x"), None);
    }

    #[test]
    fn test_translate_numeric_and_named_entries() {
        // Scenario: "8080:80,9090:web" against declared port web/80.
        let translation = translate(
            &annotations(&[
                (ANNOTATION_FORWARD, "true"),
                (ANNOTATION_PORT_MAP, "8080:80,9090:web"),
            ]),
            &[web_port()],
            BASE,
        )
        .unwrap();

        let intent = &translation.intent;
        assert_eq!(intent.port_map.get(&80), Some(&8080));
        assert_eq!(intent.name_map.get("web"), Some(&9090));
        assert_eq!(intent.external_ports(&web_port()), vec![8080, 9090]);
        assert!(translation.warnings.is_empty());
    }

    #[test]
    fn test_translate_map_size_matches_entries() {
        let translation = translate(
            &annotations(&[(ANNOTATION_PORT_MAP, "8080:80,8443:443,2222:22")]),
            &[],
            BASE,
        )
        .unwrap();

        assert_eq!(translation.intent.port_map.len(), 3);
        assert_eq!(translation.intent.port_map.get(&443), Some(&8443));
    }

    #[test]
    fn test_translate_entry_without_colon_aborts() {
        // Scenario: "80" has no colon, the whole parse fails.
        let err = translate(&annotations(&[(ANNOTATION_PORT_MAP, "80")]), &[], BASE).unwrap_err();
        assert_eq!(
            err,
            AnnotationError::InvalidPortMapEntry {
                entry: "80".to_string()
            }
        );
    }

    #[test]
    fn test_translate_malformed_entry_yields_no_partial_map() {
        let err = translate(
            &annotations(&[(ANNOTATION_PORT_MAP, "8080:80,oops")]),
            &[web_port()],
            BASE,
        )
        .unwrap_err();
        assert!(matches!(err, AnnotationError::InvalidPortMapEntry { .. }));
    }

    #[test]
    fn test_translate_non_numeric_external_aborts() {
        let err = translate(
            &annotations(&[(ANNOTATION_PORT_MAP, "http:80")]),
            &[web_port()],
            BASE,
        )
        .unwrap_err();
        assert!(matches!(err, AnnotationError::InvalidPortMapEntry { .. }));
    }

    #[test]
    fn test_translate_empty_fields_abort() {
        for value in [":80", "8080:", ":"] {
            let err = translate(&annotations(&[(ANNOTATION_PORT_MAP, value)]), &[], BASE)
                .unwrap_err();
            assert!(matches!(err, AnnotationError::InvalidPortMapEntry { .. }));
        }
    }

    #[test]
    fn test_translate_unknown_port_name_aborts() {
        let err = translate(
            &annotations(&[(ANNOTATION_PORT_MAP, "9090:api")]),
            &[web_port()],
            BASE,
        )
        .unwrap_err();
        assert_eq!(
            err,
            AnnotationError::UnknownPortName {
                entry: "9090:api".to_string(),
                name: "api".to_string()
            }
        );
    }

    #[test]
    fn test_translate_negative_external_is_a_skip_signal() {
        let translation = translate(
            &annotations(&[(ANNOTATION_PORT_MAP, "0:80,-1:web")]),
            &[web_port()],
            BASE,
        )
        .unwrap();

        assert_eq!(
            translation.intent.external_ports(&web_port()),
            vec![0, -1]
        );
    }

    #[test]
    fn test_lease_defaults_to_twice_base_requeue() {
        let translation = translate(&annotations(&[]), &[], BASE).unwrap();

        assert_eq!(translation.intent.lease_duration, BASE * 2);
        assert_eq!(translation.intent.requeue_after, BASE);
        assert!(translation.warnings.is_empty());
    }

    #[test]
    fn test_invalid_lease_warns_and_uses_default() {
        // Scenario: "not-a-duration" falls back with one warning.
        let translation = translate(
            &annotations(&[(ANNOTATION_LEASE_DURATION, "not-a-duration")]),
            &[],
            BASE,
        )
        .unwrap();

        assert_eq!(translation.intent.lease_duration, BASE * 2);
        assert_eq!(translation.intent.requeue_after, BASE);
        assert_eq!(translation.warnings.len(), 1);
        assert!(translation.warnings[0].contains("not-a-duration"));
    }

    #[test]
    fn test_valid_lease_halves_into_requeue() {
        let translation = translate(
            &annotations(&[(ANNOTATION_LEASE_DURATION, "1h")]),
            &[],
            BASE,
        )
        .unwrap();

        assert_eq!(
            translation.intent.lease_duration,
            Duration::from_secs(3600)
        );
        assert_eq!(
            translation.intent.requeue_after,
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn test_description_override_and_synthesis() {
        let with_override = translate(
            &annotations(&[(ANNOTATION_DESCRIPTION, "my mapping")]),
            &[],
            BASE,
        )
        .unwrap();
        assert_eq!(
            with_override.intent.description("default", "web", &web_port()),
            "my mapping"
        );

        let synthesized = translate(&annotations(&[]), &[], BASE).unwrap();
        assert_eq!(
            synthesized.intent.description("default", "web", &web_port()),
            "port-forward default/web port web"
        );

        let unnamed = ServicePort {
            name: String::new(),
            port: 8080,
            protocol: "TCP".to_string(),
        };
        assert_eq!(
            synthesized.intent.description("default", "web", &unnamed),
            "port-forward default/web port 8080"
        );
    }

    #[test]
    fn test_enabled_tri_state() {
        let absent = translate(&annotations(&[]), &[], BASE).unwrap();
        assert_eq!(absent.intent.enabled, None);
        assert!(absent.intent.enabled());

        let falsy = translate(&annotations(&[(ANNOTATION_ENABLED, "no")]), &[], BASE).unwrap();
        assert_eq!(falsy.intent.enabled, Some(false));
        assert!(!falsy.intent.enabled());

        let truthy = translate(&annotations(&[(ANNOTATION_ENABLED, "yes")]), &[], BASE).unwrap();
        assert!(truthy.intent.enabled());
    }

    #[test]
    fn test_remote_host_defaults_empty() {
        let translation = translate(&annotations(&[]), &[], BASE).unwrap();
        assert_eq!(translation.intent.remote_host, "");

        let filtered = translate(
            &annotations(&[(ANNOTATION_REMOTE_HOST, "203.0.113.50")]),
            &[],
            BASE,
        )
        .unwrap();
        assert_eq!(filtered.intent.remote_host, "203.0.113.50");
    }

    #[test]
    fn test_external_ports_default_to_declared_port() {
        let translation = translate(&annotations(&[]), &[], BASE).unwrap();
        assert_eq!(translation.intent.external_ports(&web_port()), vec![80]);
    }

    #[test]
    fn test_external_ports_dedup_identical_overrides() {
        let translation = translate(
            &annotations(&[(ANNOTATION_PORT_MAP, "8080:80,8080:web")]),
            &[web_port()],
            BASE,
        )
        .unwrap();
        assert_eq!(translation.intent.external_ports(&web_port()), vec![8080]);
    }
}
